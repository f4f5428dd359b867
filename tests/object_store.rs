//! Object Store Integration Tests
//!
//! The transform stage falls back to the newest raw object when ingest did
//! not record an artifact; "newest" is by modification time, not by key.

use std::time::{Duration, SystemTime};

use filetime::FileTime;
use healthpipe::adapters::LocalObjectStore;
use tempfile::TempDir;

fn backdate(path: &std::path::Path, age: Duration) {
    let when = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_mtime(path, when).unwrap();
}

#[tokio::test]
async fn test_latest_is_by_modification_time() {
    let temp = TempDir::new().unwrap();
    let store = LocalObjectStore::new(temp.path().join("raw-health-data"));

    let older = store
        .put("who/ingestion_date=2025-06-02/life_expectancy.json", b"{}".to_vec())
        .await
        .unwrap();
    let newer = store
        .put("who/ingestion_date=2025-06-01/life_expectancy.json", b"{}".to_vec())
        .await
        .unwrap();

    // The lexically larger key is the older object
    backdate(&older, Duration::from_secs(3600));
    backdate(&newer, Duration::from_secs(60));

    let latest = store.latest("who").await.unwrap();
    assert_eq!(
        latest.as_deref(),
        Some("who/ingestion_date=2025-06-01/life_expectancy.json")
    );
}

#[tokio::test]
async fn test_latest_respects_prefix() {
    let temp = TempDir::new().unwrap();
    let store = LocalObjectStore::new(temp.path());

    let other = store.put("other/data.csv", b"a,b\n".to_vec()).await.unwrap();
    let ours = store.put("who/data.json", b"[]".to_vec()).await.unwrap();
    backdate(&ours, Duration::from_secs(3600));
    backdate(&other, Duration::from_secs(1));

    assert_eq!(store.latest("who").await.unwrap().as_deref(), Some("who/data.json"));
    assert!(store.latest("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_bucket_lists_nothing() {
    let temp = TempDir::new().unwrap();
    let store = LocalObjectStore::new(temp.path().join("not-created"));

    assert!(store.list("").await.unwrap().is_empty());
    assert!(store.ensure_bucket().await.unwrap());
    assert!(!store.ensure_bucket().await.unwrap());
}

#[tokio::test]
async fn test_keys_cannot_escape_bucket() {
    let temp = TempDir::new().unwrap();
    let store = LocalObjectStore::new(temp.path().join("bucket"));

    assert!(store.put("../outside.json", b"{}".to_vec()).await.is_err());
    assert!(store.put("/etc/passwd", b"x".to_vec()).await.is_err());
    assert!(store.get("who/../../x").await.is_err());
}

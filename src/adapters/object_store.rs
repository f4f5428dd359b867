//! Filesystem-backed object store for raw payloads.
//!
//! Objects live under a bucket directory, keyed by slash-separated paths
//! (e.g. `who_life_expectancy/ingestion_date=2024-05-01/life_expectancy.json`).
//! Writes go to a temporary file first and are renamed into place, so a
//! reader never sees a partially written object.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::core::CollaboratorError;

/// Object store rooted at a bucket directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    bucket: PathBuf,
}

impl LocalObjectStore {
    pub fn new(bucket: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &Path {
        &self.bucket
    }

    /// Create the bucket directory if it does not exist
    pub async fn ensure_bucket(&self) -> Result<bool, CollaboratorError> {
        if self.bucket.exists() {
            return Ok(false);
        }
        tokio::fs::create_dir_all(&self.bucket).await?;
        Ok(true)
    }

    /// Atomically write an object
    pub async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<PathBuf, CollaboratorError> {
        let path = self.object_path(key)?;
        let size = bytes.len();

        let written = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            let dir = path.parent().unwrap_or(Path::new("."));
            fs::create_dir_all(dir)?;

            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(path)
        })
        .await
        .map_err(|e| CollaboratorError::Panicked(e.to_string()))??;

        debug!(key, size, "Stored object");
        Ok(written)
    }

    /// Read an object
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, CollaboratorError> {
        let path = self.object_path(key)?;
        if !path.exists() {
            return Err(CollaboratorError::Schema(format!(
                "raw object '{}' not found in {}",
                key,
                self.bucket.display()
            )));
        }
        Ok(tokio::fs::read(&path).await?)
    }

    /// All object keys under a prefix, with their modification times
    pub async fn list(&self, prefix: &str) -> Result<Vec<(String, SystemTime)>, CollaboratorError> {
        let bucket = self.bucket.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<(String, SystemTime)>> {
            let mut objects = Vec::new();
            if bucket.exists() {
                walk(&bucket, &bucket, &mut objects)?;
            }
            objects.retain(|(key, _)| key.starts_with(&prefix));
            objects.sort();
            Ok(objects)
        })
        .await
        .map_err(|e| CollaboratorError::Panicked(e.to_string()))?
        .map_err(CollaboratorError::from)
    }

    /// The most recently modified object under a prefix
    pub async fn latest(&self, prefix: &str) -> Result<Option<String>, CollaboratorError> {
        let objects = self.list(prefix).await?;
        Ok(objects
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
            .map(|(key, _)| key))
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, CollaboratorError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(CollaboratorError::Schema(format!("invalid object key: '{}'", key)));
        }
        Ok(self.bucket.join(relative))
    }
}

fn walk(bucket: &Path, dir: &Path, out: &mut Vec<(String, SystemTime)>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            walk(bucket, &path, out)?;
        } else if file_type.is_file() {
            let name = entry.file_name();
            // In-flight temporary files from put()
            if name.to_string_lossy().starts_with(".tmp") {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(bucket) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((key, entry.metadata()?.modified()?));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp.path().join("raw-health-data"));

        assert!(store.ensure_bucket().await.unwrap());
        assert!(!store.ensure_bucket().await.unwrap());

        store
            .put("who/ingestion_date=2024-01-01/data.json", b"{\"value\":[]}".to_vec())
            .await
            .unwrap();

        let bytes = store.get("who/ingestion_date=2024-01-01/data.json").await.unwrap();
        assert_eq!(bytes, b"{\"value\":[]}");
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp.path());

        assert!(store.put("../outside.json", vec![1]).await.is_err());
        assert!(store.put("/etc/passwd", vec![1]).await.is_err());
        assert!(store.get("").await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters_prefix() {
        let temp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp.path());

        store.put("who/a.json", vec![1]).await.unwrap();
        store.put("who/nested/b.json", vec![2]).await.unwrap();
        store.put("other/c.json", vec![3]).await.unwrap();

        let keys: Vec<String> = store.list("who").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["who/a.json".to_string(), "who/nested/b.json".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let temp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp.path());

        assert!(store.get("who/none.json").await.is_err());
        assert!(store.latest("who").await.unwrap().is_none());
    }
}

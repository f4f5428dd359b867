//! HTTP source collaborator for the ingest stage.
//!
//! Fetches the WHO GHO life-expectancy dataset and lands the raw bytes,
//! unparsed, in the object store under
//! `<dataset>/ingestion_date=YYYY-MM-DD/run_id=<id>/life_expectancy.<json|csv>`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::core::{CollaboratorError, RetryPolicy};
use crate::domain::RunId;

use super::object_store::LocalObjectStore;
use super::{Collaborator, StageContext, StageOutput};

/// Default WHO GHO OData endpoint (life expectancy at birth)
pub const DEFAULT_SOURCE_URL: &str = "https://ghoapi.azureedge.net/api/WHOSIS_000001";

/// Payload format, sniffed from the body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Csv,
}

impl PayloadFormat {
    /// JSON if the first non-whitespace byte opens an object or array
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => Self::Json,
            _ => Self::Csv,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

/// HTTP source for the ingest stage
pub struct HttpSource {
    url: String,
    client: reqwest::Client,
    store: Arc<LocalObjectStore>,
    dataset: String,
    retry: RetryPolicy,
}

impl HttpSource {
    pub fn new(url: String, store: Arc<LocalObjectStore>, dataset: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("healthpipe/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            url,
            client,
            store,
            dataset,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-request timeout (the stage timeout still bounds the whole call)
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        if let Ok(client) = reqwest::Client::builder()
            .user_agent(concat!("healthpipe/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
        {
            self.client = client;
        }
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Object key for a payload landed today by `run_id`.
    ///
    /// Keys are run-scoped so that runs on the same day never overwrite
    /// each other's raw payload.
    pub fn object_key(&self, run_id: RunId, format: PayloadFormat) -> String {
        format!(
            "{}/ingestion_date={}/run_id={}/life_expectancy.{}",
            self.dataset,
            Utc::now().format("%Y-%m-%d"),
            run_id,
            format.extension()
        )
    }

    /// GET the source, retrying transport errors and 5xx responses
    async fn fetch(&self) -> Result<Vec<u8>, CollaboratorError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.fetch_once().await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if is_transient(&e) && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Source request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self) -> Result<Vec<u8>, CollaboratorError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CollaboratorError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CollaboratorError::Request(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Collaborator for HttpSource {
    fn name(&self) -> &str {
        "http-source"
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, CollaboratorError> {
        info!(url = %self.url, attempt = ctx.attempt, "Fetching source dataset");

        let bytes = self.fetch().await?;
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(CollaboratorError::EmptyPayload);
        }

        let format = PayloadFormat::detect(&bytes);
        let records = count_records(&bytes, format)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let size = bytes.len();

        if self.store.ensure_bucket().await? {
            info!(bucket = %self.store.bucket().display(), "Created bucket");
        }

        let key = self.object_key(ctx.run_id, format);
        self.store.put(&key, bytes).await?;
        debug!(%key, %digest, "Landed raw payload");

        Ok(StageOutput::Materialized {
            records,
            summary: format!(
                "Landed {} record(s) at {} ({:.2} MB, sha256 {})",
                records,
                key,
                size as f64 / (1024.0 * 1024.0),
                &digest[..12]
            ),
            artifact: Some(key),
        })
    }
}

/// Number of records in a raw payload.
///
/// OData JSON carries rows in a top-level `value` array; a bare array is
/// also accepted. CSV rows are counted excluding the header.
pub fn count_records(bytes: &[u8], format: PayloadFormat) -> Result<u64, CollaboratorError> {
    match format {
        PayloadFormat::Json => {
            let doc: serde_json::Value = serde_json::from_slice(bytes)
                .map_err(|e| CollaboratorError::Schema(format!("invalid JSON payload: {}", e)))?;
            let rows = match &doc {
                serde_json::Value::Array(rows) => rows,
                other => other
                    .get("value")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        CollaboratorError::Schema("JSON payload has no 'value' array".to_string())
                    })?,
            };
            Ok(rows.len() as u64)
        }
        PayloadFormat::Csv => {
            let mut reader = csv::Reader::from_reader(bytes);
            let mut count = 0u64;
            for row in reader.records() {
                row.map_err(|e| CollaboratorError::Schema(format!("invalid CSV payload: {}", e)))?;
                count += 1;
            }
            Ok(count)
        }
    }
}

fn is_transient(e: &CollaboratorError) -> bool {
    match e {
        CollaboratorError::Request(_) => true,
        CollaboratorError::Status { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

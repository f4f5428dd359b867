//! Error taxonomy for the orchestration core.
//!
//! Collaborator errors and quality violations are converted into failed
//! stage executions at the runner boundary. Only ledger failures and
//! concurrency conflicts ever reach the runner's caller as errors.

use std::time::Duration;

use thiserror::Error;

use crate::domain::{QualityCheckResult, RunId, Stage};

/// An external call made on behalf of a stage failed
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Source returned an empty payload")]
    EmptyPayload,

    #[error("Schema mismatch: {0}")]
    Schema(String),

    #[error("Warehouse write failed: {0}")]
    Write(String),

    #[error("SQL error in '{model}': {message}")]
    Sql { model: String, message: String },

    #[error("{} test(s) failed: {}", failures.len(), failures.join("; "))]
    TestFailures { failures: Vec<String> },

    #[error("Command '{command}' failed with exit code {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Too few rows in '{table}': {rows} (need at least {required})")]
    InsufficientRows {
        table: String,
        rows: u64,
        required: u64,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Collaborator panicked: {0}")]
    Panicked(String),

    #[error("Collaborator '{0}' does not stage batches")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for CollaboratorError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Write(e.to_string())
    }
}

/// Blocking quality checks failed for a batch
#[derive(Debug, Clone, Error)]
#[error("{} blocking quality check(s) failed over {records} record(s)", failures.len())]
pub struct QualityViolation {
    pub records: u64,
    pub failures: Vec<QualityCheckResult>,
}

/// The upstream stage has not succeeded for this run
#[derive(Debug, Clone, Error)]
#[error("Upstream stage '{upstream}' has not succeeded ({state})")]
pub struct DependencyNotSatisfied {
    pub upstream: Stage,
    pub state: String,
}

/// Errors from the append-only ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate ledger record for run {run_id} stage '{stage}' attempt {attempt}")]
    Duplicate {
        run_id: RunId,
        stage: Stage,
        attempt: u32,
    },

    #[error("Run {0} already has a terminal outcome")]
    RunFinished(RunId),

    #[error("Ledger task failed: {0}")]
    Task(String),
}

/// Rejections surfaced by the stage runner
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Someone else is already executing this (run, stage); do not retry
    #[error("Stage '{stage}' is already in progress for run {run_id} (attempt {attempt})")]
    ConcurrencyConflict {
        run_id: RunId,
        stage: Stage,
        attempt: u32,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Severity;

    #[test]
    fn test_quality_violation_message() {
        let violation = QualityViolation {
            records: 10,
            failures: vec![
                QualityCheckResult::violation("not_null", Severity::Blocking, "null"),
                QualityCheckResult::violation("unique_key", Severity::Blocking, "dup"),
            ],
        };
        assert_eq!(
            violation.to_string(),
            "2 blocking quality check(s) failed over 10 record(s)"
        );
    }

    #[test]
    fn test_test_failures_message() {
        let err = CollaboratorError::TestFailures {
            failures: vec!["not_null(country_code)".to_string(), "row_count".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "2 test(s) failed: not_null(country_code); row_count"
        );
    }
}

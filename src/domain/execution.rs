//! Stage executions: the records kept in the append-only run ledger.
//!
//! A StageExecution is created when the runner claims a stage (outcome
//! `in_progress`) and completed exactly once. Completion produces a new
//! record for the same attempt; nothing is ever updated in place.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::RunId;
use super::stage::Stage;

/// One attempt of a stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    /// Identifier of this attempt (shared by the claim and completion records)
    pub id: Uuid,

    /// The run this execution belongs to
    pub run_id: RunId,

    /// Stage being executed
    pub stage: Stage,

    /// 1-based attempt number within (run, stage)
    pub attempt: u32,

    /// Current outcome
    pub outcome: ExecutionOutcome,

    /// Records processed (or attempted, when the stage failed)
    pub records: u64,

    /// Failed quality checks (blocking and warning)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quality_failures: Vec<QualityCheckResult>,

    /// Why the stage failed or was skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,

    /// Location of the materialized output (e.g. raw object key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,

    /// Human-readable summary (NO secrets)
    #[serde(default)]
    pub summary: String,

    /// When the attempt started
    pub started_at: DateTime<Utc>,

    /// When the attempt reached a terminal outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Time taken in milliseconds (terminal outcomes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StageExecution {
    /// Create the in-progress claim for an attempt
    pub fn started(run_id: RunId, stage: Stage, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage,
            attempt,
            outcome: ExecutionOutcome::InProgress,
            records: 0,
            quality_failures: Vec::new(),
            failure: None,
            artifact: None,
            summary: format!("Stage '{}' attempt {} started", stage, attempt),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Create a terminal `skipped` execution; the collaborator is never invoked
    pub fn skipped(run_id: RunId, stage: Stage, attempt: u32, failure: FailureDetail) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage,
            attempt,
            outcome: ExecutionOutcome::Skipped,
            records: 0,
            quality_failures: Vec::new(),
            summary: format!("Stage '{}' skipped: {}", stage, failure.message),
            failure: Some(failure),
            artifact: None,
            started_at: now,
            finished_at: Some(now),
            duration_ms: Some(0),
        }
    }

    /// Complete this attempt successfully
    pub fn succeed(&self, records: u64, artifact: Option<String>, summary: String) -> Self {
        let mut done = self.finish(ExecutionOutcome::Succeeded);
        done.records = records;
        done.artifact = artifact;
        done.summary = summary;
        done
    }

    /// Complete this attempt with a failure
    pub fn fail(&self, records: u64, failure: FailureDetail) -> Self {
        let mut done = self.finish(ExecutionOutcome::Failed);
        done.records = records;
        done.summary = format!("Stage '{}' failed: {}", self.stage, failure.message);
        done.failure = Some(failure);
        done
    }

    /// Attach quality check failures (builder style)
    pub fn with_quality_failures(mut self, failures: Vec<QualityCheckResult>) -> Self {
        self.quality_failures = failures;
        self
    }

    fn finish(&self, outcome: ExecutionOutcome) -> Self {
        let now = Utc::now();
        let elapsed = (now - self.started_at).num_milliseconds().max(0) as u64;
        Self {
            outcome,
            finished_at: Some(now),
            duration_ms: Some(elapsed),
            ..self.clone()
        }
    }

    /// Whether this execution is still running
    pub fn is_in_progress(&self) -> bool {
        self.outcome == ExecutionOutcome::InProgress
    }

    /// Whether this execution succeeded
    pub fn is_succeeded(&self) -> bool {
        self.outcome == ExecutionOutcome::Succeeded
    }

    /// An in-progress execution older than `max_duration` is treated as failed.
    ///
    /// The stored record is not touched; only the value returned to the
    /// reader reflects the reconciliation.
    pub fn reconcile(self, max_duration: Duration, now: DateTime<Utc>) -> Self {
        if !self.is_in_progress() {
            return self;
        }
        let age = (now - self.started_at).to_std().unwrap_or_default();
        if age <= max_duration {
            return self;
        }
        let message = format!(
            "in progress for {}s, longer than the {}s maximum stage duration",
            age.as_secs(),
            max_duration.as_secs()
        );
        Self {
            outcome: ExecutionOutcome::Failed,
            summary: format!("Stage '{}' failed: {}", self.stage, message),
            failure: Some(FailureDetail::new(FailureKind::ReconciledTimeout, message)),
            ..self
        }
    }

    /// Blocking quality failures recorded on this execution
    pub fn blocking_failures(&self) -> impl Iterator<Item = &QualityCheckResult> {
        self.quality_failures
            .iter()
            .filter(|r| r.severity == Severity::Blocking && !r.passed)
    }
}

/// Outcome of a stage execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Claimed and currently executing
    InProgress,

    /// Completed successfully
    Succeeded,

    /// Collaborator error or quality violation
    Failed,

    /// Not invoked because the upstream stage did not succeed
    Skipped,
}

impl ExecutionOutcome {
    /// Whether the outcome is final
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why a stage did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Failure taxonomy as recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The external call failed (network, driver, exit code, timeout)
    CollaboratorError,

    /// A blocking quality check failed
    QualityViolation,

    /// The upstream stage did not succeed
    DependencyNotSatisfied,

    /// The run was cancelled before this stage started
    Cancelled,

    /// Left in progress past the maximum stage duration
    ReconciledTimeout,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CollaboratorError => "collaborator_error",
            Self::QualityViolation => "quality_violation",
            Self::DependencyNotSatisfied => "dependency_not_satisfied",
            Self::Cancelled => "cancelled",
            Self::ReconciledTimeout => "reconciled_timeout",
        }
    }
}

/// Severity of a quality check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Failure halts the pipeline
    Blocking,

    /// Failure is reported but does not halt
    Warning,
}

/// Result of one quality check (or one violation of it)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheckResult {
    /// Check name, e.g. `not_null`
    pub check: String,

    pub severity: Severity,

    pub passed: bool,

    /// Human-readable detail
    pub detail: String,

    /// Index of the offending record within the batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
}

impl QualityCheckResult {
    /// A check that found no violations
    pub fn pass(check: &str, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            severity,
            passed: true,
            detail: detail.into(),
            record_index: None,
        }
    }

    /// A single violation of a check
    pub fn violation(check: &str, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            severity,
            passed: false,
            detail: detail.into(),
            record_index: None,
        }
    }

    /// Attach the offending record index
    pub fn at(mut self, index: usize) -> Self {
        self.record_index = Some(index);
        self
    }

    /// Whether this result is a failed blocking check
    pub fn is_blocking_failure(&self) -> bool {
        !self.passed && self.severity == Severity::Blocking
    }
}

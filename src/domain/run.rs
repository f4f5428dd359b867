//! Run identity and state.
//!
//! A Run represents a single end-to-end execution of the pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution::{ExecutionOutcome, FailureDetail, StageExecution};
use super::stage::Stage;

/// Unique, time-ordered run identifier (UUID v7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Mint a fresh run id.
    ///
    /// v7 ids embed a millisecond timestamp plus random bits, so ids sort by
    /// creation time and do not collide across concurrent processes.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for RunId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A pipeline execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: RunId,

    /// Overall outcome
    pub outcome: RunOutcome,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal outcome
    pub completed_at: Option<DateTime<Utc>>,

    /// Outcome of each stage as recorded by this run
    #[serde(default)]
    pub stages: BTreeMap<Stage, ExecutionOutcome>,

    /// First stage that did not succeed, with its reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<StageFailure>,
}

/// The stage that halted a run and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub detail: FailureDetail,
}

impl Run {
    /// Create a new in-progress run
    pub fn new(id: RunId) -> Self {
        Self {
            id,
            outcome: RunOutcome::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            stages: BTreeMap::new(),
            first_failure: None,
        }
    }

    /// Record the terminal execution of a stage
    pub fn apply_execution(&mut self, execution: &StageExecution) {
        self.stages.insert(execution.stage, execution.outcome);

        if self.first_failure.is_none() && execution.outcome != ExecutionOutcome::Succeeded {
            if let Some(ref failure) = execution.failure {
                self.first_failure = Some(StageFailure {
                    stage: execution.stage,
                    detail: failure.clone(),
                });
            }
        }
    }

    /// Move to a terminal outcome derived from the executions recorded for this run.
    ///
    /// A run succeeds iff every stage has exactly one succeeded execution.
    /// Terminal runs are immutable: calling this twice keeps the first outcome.
    pub fn finish(&mut self, executions: &[StageExecution]) {
        if self.is_finished() {
            return;
        }
        self.outcome = Self::derive_outcome(executions);
        self.completed_at = Some(Utc::now());
        // A failure that was retried successfully is not the run's failure
        if self.outcome == RunOutcome::Succeeded {
            self.first_failure = None;
        }
    }

    /// Outcome implied by a set of executions for one run
    pub fn derive_outcome(executions: &[StageExecution]) -> RunOutcome {
        let all_once = Stage::ALL.iter().all(|stage| {
            executions
                .iter()
                .filter(|e| e.stage == *stage && e.is_succeeded())
                .count()
                == 1
        });

        if all_once {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.outcome, RunOutcome::InProgress)
    }

    /// Check if the run has a terminal outcome
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    /// Wall-clock duration, if finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    InProgress,
    Succeeded,
    Failed,
}

impl Default for RunOutcome {
    fn default() -> Self {
        Self::InProgress
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::FailureKind;

    fn succeeded(run_id: RunId, stage: Stage) -> StageExecution {
        StageExecution::started(run_id, stage, 1).succeed(10, None, "ok".to_string())
    }

    #[test]
    fn test_run_creation() {
        let run_id = RunId::generate();
        let run = Run::new(run_id);

        assert_eq!(run.id, run_id);
        assert!(run.is_running());
        assert!(run.duration().is_none());
    }

    #[test]
    fn test_run_ids_are_time_ordered() {
        let first = RunId::generate();
        let second = RunId::generate();
        assert_ne!(first, second);
        assert!(first < second);

        let parsed: RunId = first.to_string().parse().unwrap();
        assert_eq!(parsed, first);
    }

    #[test]
    fn test_outcome_requires_every_stage_once() {
        let run_id = RunId::generate();
        let mut executions: Vec<_> = Stage::ALL.iter().map(|s| succeeded(run_id, *s)).collect();
        assert_eq!(Run::derive_outcome(&executions), RunOutcome::Succeeded);

        // A second success for the same stage breaks "exactly one"
        executions.push(succeeded(run_id, Stage::Ingest));
        assert_eq!(Run::derive_outcome(&executions), RunOutcome::Failed);

        assert_eq!(Run::derive_outcome(&executions[..4]), RunOutcome::Failed);
    }

    #[test]
    fn test_first_failure_is_kept() {
        let run_id = RunId::generate();
        let mut run = Run::new(run_id);

        let failed = StageExecution::started(run_id, Stage::Transform, 1).fail(
            10,
            FailureDetail::new(FailureKind::QualityViolation, "3 blocking checks failed"),
        );
        let skipped = StageExecution::skipped(
            run_id,
            Stage::DbtRun,
            1,
            FailureDetail::new(FailureKind::DependencyNotSatisfied, "transform failed"),
        );

        run.apply_execution(&failed);
        run.apply_execution(&skipped);
        run.finish(&[failed, skipped]);

        let first = run.first_failure.as_ref().unwrap();
        assert_eq!(first.stage, Stage::Transform);
        assert_eq!(first.detail.kind, FailureKind::QualityViolation);
        assert_eq!(run.outcome, RunOutcome::Failed);
        assert_eq!(run.stages[&Stage::DbtRun], ExecutionOutcome::Skipped);
    }

    #[test]
    fn test_terminal_run_is_immutable() {
        let run_id = RunId::generate();
        let mut run = Run::new(run_id);
        let executions: Vec<_> = Stage::ALL.iter().map(|s| succeeded(run_id, *s)).collect();

        run.finish(&executions);
        assert_eq!(run.outcome, RunOutcome::Succeeded);

        run.finish(&[]);
        assert_eq!(run.outcome, RunOutcome::Succeeded);
    }
}

//! Main orchestrator for pipeline execution.
//!
//! Walks the fixed stage list in order, hands each stage the previous
//! stage's execution, halts on the first stage that does not succeed and
//! records every remaining stage as skipped. Never retries on its own.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::domain::{
    ExecutionOutcome, FailureDetail, FailureKind, Run, RunId, RunOutcome, Stage, StageExecution,
    StageFailure,
};

use super::cancel::CancellationToken;
use super::error::RunnerError;
use super::ledger::{ExecutionLog, RunLedger};
use super::runner::StageRunner;

/// Main pipeline orchestrator
#[derive(Debug, Clone)]
pub struct Orchestrator {
    runner: StageRunner,
}

impl Orchestrator {
    pub fn new(runner: StageRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    pub fn ledger(&self) -> &RunLedger {
        self.runner.ledger()
    }

    /// Generate a run identifier, unique across concurrent processes
    pub fn new_run_id() -> RunId {
        RunId::generate()
    }

    /// Execute all stages for a run
    pub async fn execute(&self, run_id: RunId) -> Result<Run> {
        self.execute_with_cancel(run_id, &CancellationToken::new())
            .await
    }

    /// Execute all stages for a run, checking `cancel` before each stage.
    ///
    /// An unfinished run resumes at its first stage whose latest execution
    /// has not succeeded; earlier stages are not executed again. A stage
    /// that is already running when cancellation is requested is allowed to
    /// finish; the stages after it are recorded as skipped.
    ///
    /// A [`RunnerError::ConcurrencyConflict`] leaves the run open: another
    /// caller owns it and will finish it.
    #[instrument(skip(self, cancel), fields(run_id = %run_id))]
    pub async fn execute_with_cancel(
        &self,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<Run> {
        let ledger = self.ledger();

        let mut run = match ledger.run(run_id).await? {
            Some(existing) if existing.is_finished() => {
                anyhow::bail!("Run {} already finished ({})", run_id, existing.outcome)
            }
            Some(existing) => existing,
            None => {
                let run = Run::new(run_id);
                ledger.record_run(&run).await?;
                run
            }
        };

        let completed = completed_prefix(&ledger.executions(run_id).await?);
        if completed.is_empty() {
            info!("Starting pipeline run");
        } else {
            info!(completed = completed.len(), "Resuming pipeline run");
        }
        for execution in &completed {
            run.apply_execution(execution);
        }

        let walked = self.walk(&mut run, completed, cancel).await;

        if let Err(conflict @ RunnerError::ConcurrencyConflict { .. }) = walked {
            warn!(error = %conflict, "Run is being executed elsewhere, leaving it open");
            return Err(conflict.into());
        }

        // Finished even when the walk stopped on a ledger error, so the run
        // never stays in progress.
        let executions = ledger.executions(run_id).await?.into_vec();
        run.finish(&executions);
        ledger.record_run(&run).await?;

        walked.with_context(|| format!("Run {} aborted", run_id))?;

        match run.outcome {
            RunOutcome::Succeeded => info!("Run succeeded"),
            _ => match &run.first_failure {
                Some(first) => error!(stage = %first.stage, reason = %first.detail, "Run failed"),
                None => error!("Run failed"),
            },
        }
        Ok(run)
    }

    /// Walk the stages after the `completed` prefix
    async fn walk(
        &self,
        run: &mut Run,
        completed: Vec<StageExecution>,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError> {
        let run_id = run.id;
        let start = completed.len();
        let mut previous: Option<StageExecution> = completed.into_iter().last();
        let mut halt: Option<FailureDetail> = None;

        for stage in Stage::ALL.into_iter().skip(start) {
            if halt.is_none() && cancel.is_cancelled() {
                let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                warn!(%stage, %reason, "Run cancelled, skipping remaining stages");
                halt = Some(FailureDetail::new(
                    FailureKind::Cancelled,
                    format!("run cancelled before '{}': {}", stage, reason),
                ));
            }

            let execution = match &halt {
                Some(reason) => self.runner.skip(stage, run_id, reason.clone()).await?,
                None => {
                    self.runner
                        .run(stage, run_id, previous.as_ref())
                        .await?
                }
            };
            run.apply_execution(&execution);

            if halt.is_none() && !execution.is_succeeded() {
                halt = Some(FailureDetail::new(
                    FailureKind::DependencyNotSatisfied,
                    format!("skipped due to upstream failure at '{}'", stage),
                ));
            }
            previous = Some(execution);
        }

        Ok(())
    }

    /// Run a single stage against a run, with its upstream read from the ledger.
    ///
    /// Creates an in-progress run record if the run has none. Running the
    /// last stage finishes the run; a run that is already finished keeps its
    /// outcome and only gains the new execution.
    #[instrument(skip(self), fields(run_id = %run_id, stage = %stage))]
    pub async fn run_stage(&self, stage: Stage, run_id: RunId) -> Result<StageExecution, RunnerError> {
        let ledger = self.ledger();
        let mut run = ledger.run(run_id).await?;
        if run.is_none() {
            let fresh = Run::new(run_id);
            ledger.record_run(&fresh).await?;
            run = Some(fresh);
        }

        let execution = self.runner.run_recorded(stage, run_id).await?;

        if let Some(mut run) = run.filter(Run::is_running) {
            run.apply_execution(&execution);
            if Stage::ALL.last() == Some(&stage) {
                let executions = ledger.executions(run_id).await?.into_vec();
                run.finish(&executions);
                info!(outcome = %run.outcome, "Run finished");
            }
            ledger.record_run(&run).await?;
        }

        Ok(execution)
    }

    /// Build the terminal summary of a run from the ledger
    pub async fn summary(&self, run_id: RunId) -> Result<RunSummary> {
        let log = self.ledger().executions(run_id).await?;
        let run = self.ledger().run(run_id).await?;

        if run.is_none() && log.is_empty() {
            anyhow::bail!("Run {} not found", run_id);
        }

        let run = run.unwrap_or_else(|| Run::new(run_id));
        Ok(RunSummary::new(&run, &log))
    }

    /// Summaries of the most recent runs, newest first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut run_ids = self.ledger().runs().await?;
        run_ids.reverse();

        let mut summaries = Vec::new();
        for run_id in run_ids.into_iter().take(limit) {
            if let Ok(summary) = self.summary(run_id).await {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }
}

/// Latest executions of the leading stages that already succeeded, in stage order
fn completed_prefix(log: &ExecutionLog) -> Vec<StageExecution> {
    let mut completed = Vec::new();
    for stage in Stage::ALL {
        match log.for_stage(stage).last() {
            Some(latest) if latest.is_succeeded() => completed.push(latest.clone()),
            _ => break,
        }
    }
    completed
}

/// Outcome of one stage within a run summary
#[derive(Debug, Clone, Serialize)]
pub struct StageLine {
    pub stage: Stage,

    /// `None` when the stage has no execution in this run
    pub outcome: Option<ExecutionOutcome>,
    pub attempts: u32,
    pub records: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Terminal summary of a run, for display and external reporting
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    pub stages: Vec<StageLine>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<StageFailure>,
}

impl RunSummary {
    /// Summarize a run; each stage is described by its latest execution
    pub fn new(run: &Run, log: &ExecutionLog) -> Self {
        let stages = Stage::ALL
            .iter()
            .map(|&stage| {
                let latest = log.for_stage(stage).last();
                StageLine {
                    stage,
                    outcome: latest.map(|e| e.outcome),
                    attempts: latest.map(|e| e.attempt).unwrap_or(0),
                    records: latest.map(|e| e.records).unwrap_or(0),
                    duration_ms: latest.and_then(|e| e.duration_ms),
                    detail: latest.and_then(|e| e.failure.as_ref().map(|f| f.to_string())),
                }
            })
            .collect();

        // Prefer the failure captured while the run was live; fall back to the ledger
        let first_failure = if run.outcome == RunOutcome::Succeeded {
            None
        } else {
            run.first_failure.clone().or_else(|| {
                log.iter().find_map(|e| match (&e.outcome, &e.failure) {
                    (ExecutionOutcome::Failed | ExecutionOutcome::Skipped, Some(detail)) => {
                        Some(StageFailure {
                            stage: e.stage,
                            detail: detail.clone(),
                        })
                    }
                    _ => None,
                })
            })
        };

        Self {
            run_id: run.id,
            outcome: run.outcome,
            started_at: run.started_at,
            completed_at: run.completed_at,
            duration_ms: run.duration().map(|d| d.num_milliseconds()),
            stages,
            first_failure,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// Human-readable table
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run: {}", self.run_id);
        let _ = writeln!(out, "Outcome: {}", self.outcome);
        let _ = writeln!(out, "Started: {}", self.started_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(ms) = self.duration_ms {
            let _ = writeln!(out, "Duration: {:.1}s", ms as f64 / 1000.0);
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<12} {:<12} {:>8} {:>10} {:>10}",
            "STAGE", "OUTCOME", "ATTEMPT", "RECORDS", "MS"
        );
        let _ = writeln!(out, "{}", "-".repeat(56));

        for line in &self.stages {
            let outcome = line
                .outcome
                .map(|o| o.as_str())
                .unwrap_or("not_run");
            let ms = line
                .duration_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<12} {:<12} {:>8} {:>10} {:>10}",
                line.stage.as_str(),
                outcome,
                line.attempts,
                line.records,
                ms
            );
        }

        if let Some(failure) = &self.first_failure {
            let _ = writeln!(out);
            let _ = writeln!(out, "First failure at '{}': {}", failure.stage, failure.detail);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureKind;

    #[test]
    fn test_summary_names_first_failure_and_skips() {
        let run_id = RunId::generate();
        let ingest = StageExecution::started(run_id, Stage::Ingest, 1).succeed(3, None, "ok".to_string());
        let transform = StageExecution::started(run_id, Stage::Transform, 1)
            .fail(3, FailureDetail::new(FailureKind::QualityViolation, "2 blocking"));
        let dbt_run = StageExecution::skipped(
            run_id,
            Stage::DbtRun,
            1,
            FailureDetail::new(FailureKind::DependencyNotSatisfied, "upstream"),
        );

        let mut run = Run::new(run_id);
        for e in [&ingest, &transform, &dbt_run] {
            run.apply_execution(e);
        }
        let executions = vec![ingest, transform, dbt_run];
        run.finish(&executions);

        let log = ExecutionLog::from_executions(run_id, executions);
        let summary = RunSummary::new(&run, &log);

        assert!(!summary.is_success());
        assert_eq!(summary.first_failure.as_ref().unwrap().stage, Stage::Transform);
        assert_eq!(summary.stages[2].outcome, Some(ExecutionOutcome::Skipped));
        assert_eq!(summary.stages[4].outcome, None);

        let table = summary.render();
        assert!(table.contains("First failure at 'transform'"));
        assert!(table.contains("not_run"));
    }

    #[test]
    fn test_new_run_ids_are_unique() {
        let a = Orchestrator::new_run_id();
        let b = Orchestrator::new_run_id();
        assert_ne!(a, b);
    }
}

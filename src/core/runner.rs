//! Stage runner: executes one stage of one run as an isolated unit of work.
//!
//! Every invocation ends in exactly one logical execution in the ledger
//! (a claim plus its terminal record, or a single skipped record). Failures
//! inside the collaborator never escape: they become `failed` executions.
//! Only ledger failures and concurrency conflicts are returned as errors.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{Collaborator, Collaborators, StageContext, StageOutput};
use crate::domain::{
    Batch, FailureDetail, FailureKind, QualityCheckResult, RunId, Stage, StageExecution,
};

use super::error::{CollaboratorError, DependencyNotSatisfied, QualityViolation, RunnerError};
use super::ledger::{Claim, RunLedger};
use super::pipeline::StageLimits;
use super::quality::{self, QualityRules};

/// Executes single stages against the ledger
#[derive(Debug, Clone)]
pub struct StageRunner {
    ledger: RunLedger,
    collaborators: Collaborators,
    rules: QualityRules,
    limits: StageLimits,
}

impl StageRunner {
    pub fn new(ledger: RunLedger, collaborators: Collaborators) -> Self {
        Self {
            ledger,
            collaborators,
            rules: QualityRules::default(),
            limits: StageLimits::default(),
        }
    }

    pub fn with_rules(mut self, rules: QualityRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_limits(mut self, limits: StageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn rules(&self) -> &QualityRules {
        &self.rules
    }

    /// Run a stage given the upstream stage's execution in the same run.
    ///
    /// An unmet dependency records a `skipped` execution and never invokes
    /// the collaborator. A stage that is still in progress for this run is
    /// rejected with [`RunnerError::ConcurrencyConflict`].
    #[instrument(skip(self, upstream), fields(run_id = %run_id, stage = %stage))]
    pub async fn run(
        &self,
        stage: Stage,
        run_id: RunId,
        upstream: Option<&StageExecution>,
    ) -> Result<StageExecution, RunnerError> {
        if let Err(unmet) = check_dependency(stage, run_id, upstream) {
            info!(upstream = %unmet.upstream, state = %unmet.state, "Dependency not satisfied, skipping");
            let detail = FailureDetail::new(FailureKind::DependencyNotSatisfied, unmet.to_string());
            return self.skip(stage, run_id, detail).await;
        }

        let claim = match self.ledger.claim(run_id, stage).await? {
            Claim::Acquired(claim) => claim,
            Claim::Conflict(running) => {
                warn!(attempt = running.attempt, "Stage already in progress");
                return Err(conflict(running));
            }
        };
        info!(attempt = claim.attempt, "Stage started");

        let finished = match self.collaborators.get(stage) {
            Some(collaborator) => {
                let ctx = StageContext {
                    run_id,
                    stage,
                    attempt: claim.attempt,
                    upstream: upstream.cloned(),
                };
                self.execute(&claim, collaborator, ctx).await
            }
            None => claim.fail(
                0,
                FailureDetail::new(
                    FailureKind::CollaboratorError,
                    format!("no collaborator registered for stage '{}'", stage),
                ),
            ),
        };

        self.ledger.append(&finished).await?;
        log_outcome(&finished);
        Ok(finished)
    }

    /// Run a stage with its upstream looked up in the ledger for the same run
    pub async fn run_recorded(&self, stage: Stage, run_id: RunId) -> Result<StageExecution, RunnerError> {
        let upstream = match stage.upstream() {
            Some(up) => self.ledger.latest(run_id, up).await?,
            None => None,
        };
        self.run(stage, run_id, upstream.as_ref()).await
    }

    /// Record a stage as skipped without invoking anything
    pub async fn skip(
        &self,
        stage: Stage,
        run_id: RunId,
        detail: FailureDetail,
    ) -> Result<StageExecution, RunnerError> {
        match self.ledger.append_skipped(run_id, stage, detail).await? {
            Claim::Acquired(skipped) => {
                debug!(%stage, attempt = skipped.attempt, "Stage skipped");
                Ok(skipped)
            }
            Claim::Conflict(running) => Err(conflict(running)),
        }
    }

    async fn execute(
        &self,
        claim: &StageExecution,
        collaborator: Arc<dyn Collaborator>,
        ctx: StageContext,
    ) -> StageExecution {
        let name = collaborator.name().to_string();
        debug!(collaborator = %name, "Invoking collaborator");

        match self.invoke(collaborator.clone(), ctx).await {
            Ok(StageOutput::Materialized {
                records,
                artifact,
                summary,
            }) => claim.succeed(records, artifact, summary),
            Ok(StageOutput::Staged(batch)) => self.gate(claim, collaborator, batch).await,
            Err(e) => {
                error!(collaborator = %name, error = %e, "Collaborator failed");
                claim.fail(0, collaborator_failure(&e))
            }
        }
    }

    /// Call the collaborator in its own task, bounded by the stage timeout.
    /// Panics and timeouts come back as errors.
    async fn invoke(
        &self,
        collaborator: Arc<dyn Collaborator>,
        ctx: StageContext,
    ) -> Result<StageOutput, CollaboratorError> {
        let timeout = self.limits.timeout(ctx.stage);
        let mut handle = tokio::spawn(async move { collaborator.execute(&ctx).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(CollaboratorError::Panicked(join_error.to_string())),
            Err(_) => {
                handle.abort();
                Err(CollaboratorError::Timeout(timeout))
            }
        }
    }

    /// Validate a staged batch and commit it only if no blocking check failed
    async fn gate(
        &self,
        claim: &StageExecution,
        collaborator: Arc<dyn Collaborator>,
        batch: Batch,
    ) -> StageExecution {
        let attempted = batch.len() as u64;
        let failures: Vec<QualityCheckResult> = quality::validate(&batch, &self.rules)
            .into_iter()
            .filter(|r| !r.passed)
            .collect();
        let blocking = quality::blocking_failures(&failures);

        if !blocking.is_empty() {
            let violation = QualityViolation {
                records: attempted,
                failures: blocking,
            };
            warn!(records = attempted, blocking = violation.failures.len(), "Quality gate failed");
            return claim
                .fail(
                    attempted,
                    FailureDetail::new(FailureKind::QualityViolation, violation.to_string()),
                )
                .with_quality_failures(failures);
        }

        if !failures.is_empty() {
            warn!(warnings = failures.len(), "Quality warnings");
        }

        // Commit is not bounded by the stage timeout: it is a single
        // transaction that cannot be interrupted halfway.
        let commit = tokio::spawn(async move { collaborator.commit(batch).await });
        let committed = match commit.await {
            Ok(result) => result,
            Err(join_error) => Err(CollaboratorError::Panicked(join_error.to_string())),
        };

        match committed {
            Ok(written) => claim
                .succeed(
                    written,
                    None,
                    format!("Validated and committed {} of {} record(s)", written, attempted),
                )
                .with_quality_failures(failures),
            Err(e) => {
                error!(error = %e, "Commit failed");
                claim
                    .fail(attempted, collaborator_failure(&e))
                    .with_quality_failures(failures)
            }
        }
    }
}

/// The upstream must be the previous stage of the same run, and succeeded
fn check_dependency(
    stage: Stage,
    run_id: RunId,
    upstream: Option<&StageExecution>,
) -> Result<(), DependencyNotSatisfied> {
    let Some(expected) = stage.upstream() else {
        return Ok(());
    };

    match upstream {
        None => Err(DependencyNotSatisfied {
            upstream: expected,
            state: "not run".to_string(),
        }),
        Some(e) if e.stage != expected || e.run_id != run_id => Err(DependencyNotSatisfied {
            upstream: expected,
            state: format!("got '{}' from run {}", e.stage, e.run_id),
        }),
        Some(e) if !e.is_succeeded() => Err(DependencyNotSatisfied {
            upstream: expected,
            state: e.outcome.to_string(),
        }),
        Some(_) => Ok(()),
    }
}

fn collaborator_failure(e: &CollaboratorError) -> FailureDetail {
    FailureDetail::new(FailureKind::CollaboratorError, e.to_string())
}

fn conflict(running: StageExecution) -> RunnerError {
    RunnerError::ConcurrencyConflict {
        run_id: running.run_id,
        stage: running.stage,
        attempt: running.attempt,
    }
}

fn log_outcome(execution: &StageExecution) {
    let duration_ms = execution.duration_ms.unwrap_or_default();
    if execution.is_succeeded() {
        info!(
            attempt = execution.attempt,
            records = execution.records,
            duration_ms,
            "Stage succeeded"
        );
    } else {
        let reason = execution
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_default();
        error!(
            attempt = execution.attempt,
            records = execution.records,
            duration_ms,
            %reason,
            "Stage failed"
        );
    }
}

//! Core orchestration logic.
//!
//! This module contains:
//! - Quality: Batch validation checks
//! - Ledger: Append-only record of stage executions and runs
//! - Runner: Single-stage execution with the quality gate
//! - Orchestrator: Main execution engine
//! - Pipeline: Stage limits and retry policy

pub mod cancel;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod quality;
pub mod runner;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use error::{
    CollaboratorError, DependencyNotSatisfied, LedgerError, QualityViolation, RunnerError,
};
pub use ledger::{Claim, ExecutionLog, LedgerRecord, RunLedger};
pub use orchestrator::{Orchestrator, RunSummary, StageLine};
pub use pipeline::{RetryPolicy, StageLimits};
pub use quality::{validate, QualityRules};
pub use runner::StageRunner;

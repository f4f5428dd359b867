//! Domain types for the healthpipe orchestrator.
//!
//! This module contains the core data structures:
//! - Stage: The fixed stage list and its dependency chain
//! - Run: Pipeline execution identity and outcome
//! - StageExecution: Ledger records of stage attempts
//! - Batch: Records moving through the transform stage

pub mod batch;
pub mod execution;
pub mod run;
pub mod stage;

// Re-export commonly used types
pub use batch::{Batch, Record};
pub use execution::{
    ExecutionOutcome, FailureDetail, FailureKind, QualityCheckResult, Severity, StageExecution,
};
pub use run::{Run, RunId, RunOutcome, StageFailure};
pub use stage::Stage;

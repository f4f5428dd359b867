//! healthpipe - Quality-gated batch pipeline for WHO health statistics
//!
//! Fetches the WHO life-expectancy dataset, validates and loads it into a
//! local warehouse, builds analytics models, tests them and trains a model
//! on the result.
//!
//! # Architecture
//!
//! The system is built around an append-only run ledger:
//! - Every stage attempt is claimed, then completed, as ledger records
//! - Current state is derived from the latest record per attempt
//! - A failed stage halts the run; later stages are recorded as skipped
//!
//! # Modules
//!
//! - `adapters`: Collaborators for the external systems (HTTP, object store, SQLite, commands)
//! - `core`: Orchestration logic (Ledger, Runner, Orchestrator, Quality)
//! - `domain`: Data structures (Stage, Run, StageExecution, Batch)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run every stage
//! healthpipe pipeline
//!
//! # Run one stage against the most recent run
//! healthpipe transform
//!
//! # Inspect a run
//! healthpipe logs <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{Collaborator, Collaborators, StageContext, StageOutput};
pub use core::{CancellationToken, Orchestrator, RunLedger, RunSummary, StageRunner};
pub use domain::{Batch, ExecutionOutcome, Run, RunId, RunOutcome, Stage, StageExecution};

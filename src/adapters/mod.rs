//! Collaborator interfaces for the external systems each stage delegates to.
//!
//! The stage runner only ever talks to a [`Collaborator`]. Concrete
//! collaborators exist per stage: an HTTP source (ingest), a warehouse loader
//! (transform), SQL models and tests (dbt-run, dbt-test) and a training
//! command (train).

pub mod command;
pub mod models;
pub mod object_store;
pub mod source;
pub mod train;
pub mod warehouse;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ResolvedConfig;
use crate::core::CollaboratorError;
use crate::domain::{Batch, RunId, Stage, StageExecution};

pub use command::{CommandCollaborator, CommandSpec};
pub use models::{SqlModels, SqlTests};
pub use object_store::LocalObjectStore;
pub use source::HttpSource;
pub use train::TrainCollaborator;
pub use warehouse::{Warehouse, WarehouseLoader};

/// What a collaborator is told about the attempt it serves
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub stage: Stage,
    pub attempt: u32,

    /// The succeeded upstream execution (absent for the first stage)
    pub upstream: Option<StageExecution>,
}

impl StageContext {
    /// Artifact materialized by the upstream stage, if it recorded one
    pub fn upstream_artifact(&self) -> Option<&str> {
        self.upstream.as_ref().and_then(|e| e.artifact.as_deref())
    }
}

/// Output from a collaborator execution
#[derive(Debug, Clone)]
pub enum StageOutput {
    /// Output fully materialized by the collaborator
    Materialized {
        records: u64,
        artifact: Option<String>,
        summary: String,
    },

    /// A batch held back until it passes the quality gate; written via
    /// [`Collaborator::commit`] only if every blocking check passes
    Staged(Batch),
}

impl StageOutput {
    pub fn materialized(records: u64, summary: impl Into<String>) -> Self {
        Self::Materialized {
            records,
            artifact: None,
            summary: summary.into(),
        }
    }
}

/// Trait for stage collaborators
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Human-readable collaborator name
    fn name(&self) -> &str;

    /// Do the stage's work
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, CollaboratorError>;

    /// Write a staged batch in full, returning the number of records written
    async fn commit(&self, _batch: Batch) -> Result<u64, CollaboratorError> {
        Err(CollaboratorError::Unsupported(self.name().to_string()))
    }
}

/// The collaborator registered for each stage
#[derive(Clone, Default)]
pub struct Collaborators {
    by_stage: HashMap<Stage, Arc<dyn Collaborator>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collaborator for a stage (builder style)
    pub fn with(mut self, stage: Stage, collaborator: Arc<dyn Collaborator>) -> Self {
        self.by_stage.insert(stage, collaborator);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn Collaborator>> {
        self.by_stage.get(&stage).cloned()
    }

    /// Stages without a collaborator
    pub fn missing(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| !self.by_stage.contains_key(s))
            .collect()
    }

    /// Build the default collaborators from configuration
    pub fn from_config(cfg: &ResolvedConfig) -> Result<Self> {
        let store = Arc::new(LocalObjectStore::new(cfg.object_store.clone()));
        let warehouse = Warehouse::new(cfg.warehouse.clone());

        let source = HttpSource::new(
            cfg.source.url.clone(),
            store.clone(),
            cfg.source.dataset.clone(),
        )?
        .with_retry_policy(cfg.source.retry.clone())
        .with_request_timeout(cfg.source.request_timeout());

        let loader = WarehouseLoader::new(store, warehouse.clone(), cfg.source.dataset.clone())
            .with_max_rows(cfg.source.max_rows);

        let train = TrainCollaborator::new(warehouse.clone(), cfg.models_dir())
            .with_command(
                cfg.train
                    .command
                    .clone()
                    .map(|spec| CommandCollaborator::new("train", spec)),
            )
            .with_min_rows(cfg.train.min_rows)
            .with_holdout_every(cfg.train.holdout_every);

        Ok(Self::new()
            .with(Stage::Ingest, Arc::new(source))
            .with(Stage::Transform, Arc::new(loader))
            .with(Stage::DbtRun, Arc::new(SqlModels::new(warehouse.clone())))
            .with(Stage::DbtTest, Arc::new(SqlTests::new(warehouse)))
            .with(Stage::Train, Arc::new(train)))
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for stage in Stage::ALL {
            if let Some(c) = self.by_stage.get(&stage) {
                map.entry(&stage.as_str(), &c.name());
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Collaborator for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, CollaboratorError> {
            Ok(StageOutput::materialized(0, "nothing"))
        }
    }

    #[tokio::test]
    async fn test_commit_unsupported_by_default() {
        let err = Noop.commit(Batch::default()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Unsupported(name) if name == "noop"));
    }

    #[test]
    fn test_missing_stages() {
        let collaborators = Collaborators::new()
            .with(Stage::Ingest, Arc::new(Noop))
            .with(Stage::Train, Arc::new(Noop));

        assert_eq!(
            collaborators.missing(),
            vec![Stage::Transform, Stage::DbtRun, Stage::DbtTest]
        );
        assert_eq!(collaborators.get(Stage::Ingest).unwrap().name(), "noop");
    }

    #[test]
    fn test_upstream_artifact() {
        let run_id = RunId::generate();
        let ingest = StageExecution::started(run_id, Stage::Ingest, 1).succeed(
            3,
            Some("who_life_expectancy/ingestion_date=2024-01-01/life_expectancy.json".to_string()),
            "ok".to_string(),
        );
        let ctx = StageContext {
            run_id,
            stage: Stage::Transform,
            attempt: 1,
            upstream: Some(ingest),
        };

        assert!(ctx.upstream_artifact().unwrap().ends_with("life_expectancy.json"));
    }
}

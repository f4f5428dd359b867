//! The fixed, linear stage list of the pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named unit of work with a fixed position in the pipeline.
///
/// The dependency chain is strictly linear: every stage depends on the
/// stage immediately before it, and `ingest` has no upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Fetch the source API and land the raw payload in the object store
    Ingest,

    /// Parse, validate and load the raw payload into the warehouse
    Transform,

    /// Materialize the analytics models
    DbtRun,

    /// Run the declared tests over the analytics models
    DbtTest,

    /// Train the downstream model on the mart table
    Train,
}

impl Stage {
    /// All stages in dependency order
    pub const ALL: [Stage; 5] = [
        Stage::Ingest,
        Stage::Transform,
        Stage::DbtRun,
        Stage::DbtTest,
        Stage::Train,
    ];

    /// Zero-based position in the pipeline
    pub fn ordinal(self) -> usize {
        match self {
            Stage::Ingest => 0,
            Stage::Transform => 1,
            Stage::DbtRun => 2,
            Stage::DbtTest => 3,
            Stage::Train => 4,
        }
    }

    /// The stage that must succeed before this one may run
    pub fn upstream(self) -> Option<Stage> {
        match self {
            Stage::Ingest => None,
            Stage::Transform => Some(Stage::Ingest),
            Stage::DbtRun => Some(Stage::Transform),
            Stage::DbtTest => Some(Stage::DbtRun),
            Stage::Train => Some(Stage::DbtTest),
        }
    }

    /// Stages strictly after this one
    pub fn downstream(self) -> &'static [Stage] {
        &Self::ALL[self.ordinal() + 1..]
    }

    /// Stable name used in the ledger, logs and CLI
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Transform => "transform",
            Stage::DbtRun => "dbt-run",
            Stage::DbtTest => "dbt-test",
            Stage::Train => "train",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_chain_is_linear() {
        assert_eq!(Stage::Ingest.upstream(), None);
        for pair in Stage::ALL.windows(2) {
            assert_eq!(pair[1].upstream(), Some(pair[0]));
            assert_eq!(pair[1].ordinal(), pair[0].ordinal() + 1);
        }
    }

    #[test]
    fn test_downstream() {
        assert_eq!(
            Stage::Transform.downstream(),
            &[Stage::DbtRun, Stage::DbtTest, Stage::Train]
        );
        assert!(Stage::Train.downstream().is_empty());
    }

    #[test]
    fn test_name_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert_eq!(
            serde_json::to_string(&Stage::DbtRun).unwrap(),
            "\"dbt-run\""
        );
        assert!("model".parse::<Stage>().is_err());
    }
}

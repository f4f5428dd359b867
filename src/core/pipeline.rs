//! Stage execution limits and retry policy.
//!
//! Limits are loaded from the `stages:` section of the config file; the
//! retry policy is used by collaborators that retry transient failures
//! within a single stage attempt (the orchestrator itself never retries).

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::domain::Stage;

/// Per-stage timeouts and the in-progress reconciliation window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLimits {
    /// Default collaborator timeout in seconds (default: 1800 = 30 min)
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: u64,

    /// Per-stage overrides of the collaborator timeout
    #[serde(default)]
    pub timeouts: BTreeMap<Stage, u64>,

    /// An in-progress execution older than this reads as failed (default: 2 hours)
    #[serde(default = "default_max_stage_duration")]
    pub max_stage_duration_seconds: u64,
}

fn default_stage_timeout() -> u64 {
    1800
}
fn default_max_stage_duration() -> u64 {
    7200
}

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            stage_timeout_seconds: default_stage_timeout(),
            timeouts: BTreeMap::new(),
            max_stage_duration_seconds: default_max_stage_duration(),
        }
    }
}

impl StageLimits {
    /// Effective collaborator timeout for a stage
    pub fn timeout(&self, stage: Stage) -> Duration {
        let seconds = self
            .timeouts
            .get(&stage)
            .copied()
            .unwrap_or(self.stage_timeout_seconds);
        Duration::from_secs(seconds)
    }

    pub fn max_stage_duration(&self) -> Duration {
        Duration::from_secs(self.max_stage_duration_seconds)
    }

    /// A live execution must never be reconciled as failed while its
    /// collaborator may still be running.
    pub fn validate(&self) -> Result<()> {
        for stage in Stage::ALL {
            let timeout = self.timeout(stage);
            if timeout.is_zero() {
                anyhow::bail!("Timeout for stage '{}' must be greater than zero", stage);
            }
            if timeout > self.max_stage_duration() {
                anyhow::bail!(
                    "Timeout for stage '{}' ({}s) exceeds max_stage_duration_seconds ({}s)",
                    stage,
                    timeout.as_secs(),
                    self.max_stage_duration_seconds
                );
            }
        }
        Ok(())
    }
}

/// Retry policy for transient collaborator failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS_YAML: &str = r#"
stage_timeout_seconds: 600
timeouts:
  train: 3600
max_stage_duration_seconds: 5400
"#;

    #[test]
    fn test_limits_parsing() {
        let limits: StageLimits = serde_yaml::from_str(LIMITS_YAML).unwrap();

        assert_eq!(limits.timeout(Stage::Ingest), Duration::from_secs(600));
        assert_eq!(limits.timeout(Stage::Train), Duration::from_secs(3600));
        assert_eq!(limits.max_stage_duration(), Duration::from_secs(5400));
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_timeout_longer_than_reconciliation_window_rejected() {
        let limits = StageLimits {
            stage_timeout_seconds: 600,
            max_stage_duration_seconds: 300,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::none();
        assert!(!policy.should_retry(1));
    }
}

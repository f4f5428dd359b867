//! Data quality checks over a transform batch.
//!
//! Every check runs independently over the whole batch, so a single pass
//! reports every violation. A check emits one passing result when it finds
//! nothing, otherwise one failing result per violation. Validation never
//! errors: malformed values are reported as failed checks.

use std::collections::HashMap;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::batch::{self, Batch};
use crate::domain::{QualityCheckResult, Severity};

pub const SCHEMA_SHAPE: &str = "schema_shape";
pub const NON_EMPTY: &str = "non_empty";
pub const NOT_NULL: &str = "not_null";
pub const UNIQUE_KEY: &str = "unique_key";
pub const MEASURE_RANGE: &str = "measure_range";
pub const PERIOD_PLAUSIBLE: &str = "period_plausible";

/// Thresholds and column sets used by the checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRules {
    /// Columns that must be present in the batch (default: all canonical columns)
    #[serde(default = "default_expected_columns")]
    pub expected_columns: Vec<String>,

    /// Fields that must be non-null on every record
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,

    /// Composite key that must be unique (entity + time period + dimension)
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,

    /// Upper plausible bound for the measure (default: 120 years)
    #[serde(default = "default_max_measure")]
    pub max_measure: f64,

    /// Earliest plausible period (default: 1900)
    #[serde(default = "default_min_period")]
    pub min_period: i32,
}

fn default_expected_columns() -> Vec<String> {
    batch::COLUMNS.iter().map(|c| c.to_string()).collect()
}
fn default_required_fields() -> Vec<String> {
    vec![
        batch::ENTITY_CODE.to_string(),
        batch::PERIOD.to_string(),
        batch::CATEGORY.to_string(),
        batch::MEASURE_VALUE.to_string(),
    ]
}
fn default_key_fields() -> Vec<String> {
    vec![
        batch::ENTITY_CODE.to_string(),
        batch::PERIOD.to_string(),
        batch::CATEGORY.to_string(),
    ]
}
fn default_max_measure() -> f64 {
    120.0
}
fn default_min_period() -> i32 {
    1900
}

impl Default for QualityRules {
    fn default() -> Self {
        Self {
            expected_columns: default_expected_columns(),
            required_fields: default_required_fields(),
            key_fields: default_key_fields(),
            max_measure: default_max_measure(),
            min_period: default_min_period(),
        }
    }
}

/// Run every check over the batch, in a fixed order
pub fn validate(batch: &Batch, rules: &QualityRules) -> Vec<QualityCheckResult> {
    let mut results = Vec::new();
    results.extend(check_schema_shape(batch, rules));
    results.extend(check_non_empty(batch));
    results.extend(check_not_null(batch, rules));
    results.extend(check_unique_key(batch, rules));
    results.extend(check_measure_range(batch, rules));
    results.extend(check_period_plausible(batch, rules));
    results
}

/// Failed blocking results only
pub fn blocking_failures(results: &[QualityCheckResult]) -> Vec<QualityCheckResult> {
    results
        .iter()
        .filter(|r| r.is_blocking_failure())
        .cloned()
        .collect()
}

fn check_schema_shape(batch: &Batch, rules: &QualityRules) -> Vec<QualityCheckResult> {
    let missing: Vec<QualityCheckResult> = rules
        .expected_columns
        .iter()
        .filter(|c| !batch.columns.contains(c.as_str()))
        .map(|c| {
            QualityCheckResult::violation(
                SCHEMA_SHAPE,
                Severity::Blocking,
                format!("expected column '{}' is missing", c),
            )
        })
        .collect();

    if missing.is_empty() {
        vec![QualityCheckResult::pass(
            SCHEMA_SHAPE,
            Severity::Blocking,
            format!("all {} expected columns present", rules.expected_columns.len()),
        )]
    } else {
        missing
    }
}

fn check_non_empty(batch: &Batch) -> Vec<QualityCheckResult> {
    if batch.is_empty() {
        vec![QualityCheckResult::violation(
            NON_EMPTY,
            Severity::Blocking,
            "batch contains no records",
        )]
    } else {
        vec![QualityCheckResult::pass(
            NON_EMPTY,
            Severity::Blocking,
            format!("{} records", batch.len()),
        )]
    }
}

fn check_not_null(batch: &Batch, rules: &QualityRules) -> Vec<QualityCheckResult> {
    let mut failures = Vec::new();

    for (idx, record) in batch.iter().enumerate() {
        let missing: Vec<&str> = rules
            .required_fields
            .iter()
            .map(String::as_str)
            .filter(|f| record.is_missing(f))
            .collect();

        if !missing.is_empty() {
            failures.push(
                QualityCheckResult::violation(
                    NOT_NULL,
                    Severity::Blocking,
                    format!("record {} has null required field(s): {}", idx, missing.join(", ")),
                )
                .at(idx),
            );
        }
    }

    if failures.is_empty() {
        vec![QualityCheckResult::pass(
            NOT_NULL,
            Severity::Blocking,
            "no null required fields",
        )]
    } else {
        failures
    }
}

fn check_unique_key(batch: &Batch, rules: &QualityRules) -> Vec<QualityCheckResult> {
    let mut first_seen: HashMap<Vec<String>, usize> = HashMap::new();
    let mut failures = Vec::new();

    for (idx, record) in batch.iter().enumerate() {
        // Incomplete keys are reported by not_null
        let key: Option<Vec<String>> = rules.key_fields.iter().map(|f| record.text(f)).collect();
        let Some(key) = key else { continue };

        match first_seen.get(&key) {
            Some(&first) => failures.push(
                QualityCheckResult::violation(
                    UNIQUE_KEY,
                    Severity::Blocking,
                    format!(
                        "record {} duplicates key ({}) first seen at record {}",
                        idx,
                        key.join(", "),
                        first
                    ),
                )
                .at(idx),
            ),
            None => {
                first_seen.insert(key, idx);
            }
        }
    }

    if failures.is_empty() {
        vec![QualityCheckResult::pass(
            UNIQUE_KEY,
            Severity::Blocking,
            format!("{} distinct keys", first_seen.len()),
        )]
    } else {
        failures
    }
}

fn check_measure_range(batch: &Batch, rules: &QualityRules) -> Vec<QualityCheckResult> {
    let mut failures = Vec::new();

    for (idx, record) in batch.iter().enumerate() {
        if record.is_missing(batch::MEASURE_VALUE) {
            continue;
        }

        let problem = match record.number(batch::MEASURE_VALUE) {
            None => Some("is not numeric".to_string()),
            Some(v) if !v.is_finite() => Some("is not finite".to_string()),
            Some(v) if v < 0.0 => Some(format!("{} is negative", v)),
            Some(v) if v > rules.max_measure => {
                Some(format!("{} exceeds plausible bound {}", v, rules.max_measure))
            }
            Some(_) => None,
        };

        if let Some(problem) = problem {
            failures.push(
                QualityCheckResult::violation(
                    MEASURE_RANGE,
                    Severity::Blocking,
                    format!("record {} measure {}", idx, problem),
                )
                .at(idx),
            );
        }
    }

    if failures.is_empty() {
        vec![QualityCheckResult::pass(
            MEASURE_RANGE,
            Severity::Blocking,
            format!("all measures within [0, {}]", rules.max_measure),
        )]
    } else {
        failures
    }
}

fn check_period_plausible(batch: &Batch, rules: &QualityRules) -> Vec<QualityCheckResult> {
    let max_period = Utc::now().year() + 1;
    let mut failures = Vec::new();

    for (idx, record) in batch.iter().enumerate() {
        let Some(raw) = record.text(batch::PERIOD) else { continue };

        let plausible = raw
            .parse::<i32>()
            .map(|year| (rules.min_period..=max_period).contains(&year))
            .unwrap_or(false);

        if !plausible {
            failures.push(
                QualityCheckResult::violation(
                    PERIOD_PLAUSIBLE,
                    Severity::Warning,
                    format!(
                        "record {} period '{}' outside [{}, {}]",
                        idx, raw, rules.min_period, max_period
                    ),
                )
                .at(idx),
            );
        }
    }

    if failures.is_empty() {
        vec![QualityCheckResult::pass(
            PERIOD_PLAUSIBLE,
            Severity::Warning,
            "all periods plausible",
        )]
    } else {
        failures
    }
}

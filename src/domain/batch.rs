//! Batches of records moving through the transform stage.
//!
//! Records are kept loosely typed (JSON values under canonical column
//! names) so that malformed source rows survive long enough to be reported
//! by the quality checks instead of failing the parse.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the reporting entity (country)
pub const ENTITY_NAME: &str = "entity_name";
/// Code of the reporting entity (ISO country code)
pub const ENTITY_CODE: &str = "entity_code";
/// Time period (year)
pub const PERIOD: &str = "period";
/// Dimension value (sex)
pub const CATEGORY: &str = "category";
/// Numeric measure (life expectancy in years)
pub const MEASURE_VALUE: &str = "measure_value";

/// The canonical column set of a batch
pub const COLUMNS: [&str; 5] = [ENTITY_NAME, ENTITY_CODE, PERIOD, CATEGORY, MEASURE_VALUE];

/// A single source record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field (builder style)
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(column.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Absent, JSON null, or a blank string
    pub fn is_missing(&self, column: &str) -> bool {
        match self.fields.get(column) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        }
    }

    /// Field rendered as text; numbers are formatted without quotes
    pub fn text(&self, column: &str) -> Option<String> {
        match self.fields.get(column)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Field as a number; numeric strings are accepted
    pub fn number(&self, column: &str) -> Option<f64> {
        match self.fields.get(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// An in-memory set of records plus the column set observed in the source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub columns: BTreeSet<String>,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(columns: BTreeSet<String>, records: Vec<Record>) -> Self {
        Self { columns, records }
    }

    /// Build a batch whose column set is the union of the records' fields
    pub fn from_records(records: Vec<Record>) -> Self {
        let columns = records
            .iter()
            .flat_map(|r| r.columns().map(str::to_string))
            .collect();
        Self { columns, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// Keep only the first `n` records
    pub fn truncate(&mut self, n: usize) {
        self.records.truncate(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_values() {
        let record = Record::new()
            .with(ENTITY_CODE, "RWA")
            .with(CATEGORY, "  ")
            .with(MEASURE_VALUE, Value::Null);

        assert!(!record.is_missing(ENTITY_CODE));
        assert!(record.is_missing(CATEGORY));
        assert!(record.is_missing(MEASURE_VALUE));
        assert!(record.is_missing(PERIOD));
    }

    #[test]
    fn test_text_and_number_coercion() {
        let record = Record::new()
            .with(PERIOD, 2020)
            .with(MEASURE_VALUE, "69.3")
            .with(ENTITY_NAME, json!(["not", "text"]));

        assert_eq!(record.text(PERIOD), Some("2020".to_string()));
        assert_eq!(record.number(MEASURE_VALUE), Some(69.3));
        assert_eq!(record.text(ENTITY_NAME), None);
        assert_eq!(record.number(ENTITY_NAME), None);
    }

    #[test]
    fn test_columns_from_records() {
        let batch = Batch::from_records(vec![
            Record::new().with(ENTITY_CODE, "RWA"),
            Record::new().with(PERIOD, 2020),
        ]);

        assert_eq!(batch.len(), 2);
        assert!(batch.columns.contains(ENTITY_CODE));
        assert!(batch.columns.contains(PERIOD));
        assert!(!batch.columns.contains(MEASURE_VALUE));
    }
}

//! Analytics models (dbt-run) and their declared tests (dbt-test).
//!
//! Models are plain SQL over the warehouse, materialized in dependency
//! order inside one transaction: a staging view over the raw table and a
//! country/year mart aggregating the measure.

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::core::CollaboratorError;

use super::warehouse::{relation_exists, Warehouse, RAW_TABLE};
use super::{Collaborator, StageContext, StageOutput};

pub const STAGING_VIEW: &str = "stg_life_expectancy";
pub const MART_TABLE: &str = "mart_country_life_expectancy";

/// How a model is materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialization {
    View,
    Table,
}

impl Materialization {
    fn keyword(self) -> &'static str {
        match self {
            Self::View => "VIEW",
            Self::Table => "TABLE",
        }
    }
}

/// A named SELECT materialized as a view or table
#[derive(Debug, Clone)]
pub struct SqlModel {
    pub name: &'static str,
    pub materialized: Materialization,
    pub select: &'static str,
}

impl SqlModel {
    fn build(&self, conn: &Connection) -> Result<(), CollaboratorError> {
        let kind = self.materialized.keyword();
        let sql = format!(
            "DROP {kind} IF EXISTS {name}; CREATE {kind} {name} AS {select};",
            kind = kind,
            name = self.name,
            select = self.select
        );
        conn.execute_batch(&sql).map_err(|e| CollaboratorError::Sql {
            model: self.name.to_string(),
            message: e.to_string(),
        })
    }
}

/// The built-in models, in dependency order
pub fn builtin_models() -> Vec<SqlModel> {
    vec![
        SqlModel {
            name: STAGING_VIEW,
            materialized: Materialization::View,
            select: "SELECT
                    TRIM(country_code) AS country_code,
                    TRIM(country_name) AS country_name,
                    CAST(year AS INTEGER) AS year,
                    sex,
                    CAST(life_expectancy AS REAL) AS life_expectancy,
                    ingested_at
                FROM health_life_expectancy
                WHERE life_expectancy IS NOT NULL",
        },
        SqlModel {
            name: MART_TABLE,
            materialized: Materialization::Table,
            select: "SELECT
                    country_code,
                    country_name,
                    year,
                    AVG(life_expectancy) AS avg_life_expectancy,
                    COUNT(*) AS observations
                FROM stg_life_expectancy
                GROUP BY country_code, country_name, year
                ORDER BY country_code, year",
        },
    ]
}

/// dbt-run collaborator
pub struct SqlModels {
    warehouse: Warehouse,
    models: Vec<SqlModel>,
}

impl SqlModels {
    pub fn new(warehouse: Warehouse) -> Self {
        Self {
            warehouse,
            models: builtin_models(),
        }
    }

    pub fn with_models(mut self, models: Vec<SqlModel>) -> Self {
        self.models = models;
        self
    }
}

#[async_trait]
impl Collaborator for SqlModels {
    fn name(&self) -> &str {
        "sql-models"
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, CollaboratorError> {
        let models = self.models.clone();
        let names: Vec<&'static str> = models.iter().map(|m| m.name).collect();

        let mart_rows = self
            .warehouse
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                for model in &models {
                    debug!(model = model.name, "Building model");
                    model.build(&tx)?;
                }
                let last = models.last().map(|m| m.name);
                let rows = match last {
                    Some(name) => {
                        let n: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {}", name), [], |r| r.get(0))?;
                        n.max(0) as u64
                    }
                    None => 0,
                };
                tx.commit()?;
                Ok(rows)
            })
            .await?;

        info!(models = ?names, rows = mart_rows, "Models built");
        Ok(StageOutput::Materialized {
            records: mart_rows,
            artifact: names.last().map(|n| n.to_string()),
            summary: format!("Built {} model(s); {} has {} row(s)", names.len(), MART_TABLE, mart_rows),
        })
    }
}

/// A declared data test: a query counting offending rows (zero means pass)
#[derive(Debug, Clone)]
pub struct SqlTest {
    pub name: String,
    pub relation: &'static str,
    pub failing_rows: String,
}

impl SqlTest {
    pub fn not_null(relation: &'static str, column: &str) -> Self {
        Self {
            name: format!("not_null({}.{})", relation, column),
            relation,
            failing_rows: format!("SELECT COUNT(*) FROM {} WHERE {} IS NULL", relation, column),
        }
    }

    pub fn unique(relation: &'static str, columns: &[&str]) -> Self {
        let key = columns.join(", ");
        Self {
            name: format!("unique({}.{})", relation, key),
            relation,
            failing_rows: format!(
                "SELECT COUNT(*) FROM (SELECT {key} FROM {rel} GROUP BY {key} HAVING COUNT(*) > 1)",
                key = key,
                rel = relation
            ),
        }
    }

    pub fn not_empty(relation: &'static str) -> Self {
        Self {
            name: format!("row_count({}) > 0", relation),
            relation,
            failing_rows: format!(
                "SELECT CASE WHEN COUNT(*) = 0 THEN 1 ELSE 0 END FROM {}",
                relation
            ),
        }
    }

    /// Number of offending rows; a missing relation counts as one
    fn failures(&self, conn: &Connection) -> Result<u64, CollaboratorError> {
        if !relation_exists(conn, self.relation)? {
            return Ok(1);
        }
        let n: i64 = conn
            .query_row(&self.failing_rows, [], |r| r.get(0))
            .map_err(|e| CollaboratorError::Sql {
                model: self.name.clone(),
                message: e.to_string(),
            })?;
        Ok(n.max(0) as u64)
    }
}

/// The built-in tests over the staging view and the mart
pub fn builtin_tests() -> Vec<SqlTest> {
    vec![
        SqlTest::not_null(STAGING_VIEW, "country_code"),
        SqlTest::not_null(STAGING_VIEW, "year"),
        SqlTest::not_null(MART_TABLE, "country_code"),
        SqlTest::not_null(MART_TABLE, "year"),
        SqlTest::not_null(MART_TABLE, "avg_life_expectancy"),
        SqlTest::unique(MART_TABLE, &["country_code", "year"]),
        SqlTest::not_empty(RAW_TABLE),
        SqlTest::not_empty(MART_TABLE),
    ]
}

/// dbt-test collaborator: every declared test must pass
pub struct SqlTests {
    warehouse: Warehouse,
    tests: Vec<SqlTest>,
}

impl SqlTests {
    pub fn new(warehouse: Warehouse) -> Self {
        Self {
            warehouse,
            tests: builtin_tests(),
        }
    }
}

#[async_trait]
impl Collaborator for SqlTests {
    fn name(&self) -> &str {
        "sql-tests"
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, CollaboratorError> {
        let tests = self.tests.clone();
        let results = self
            .warehouse
            .with_connection(move |conn| {
                tests
                    .iter()
                    .map(|t| t.failures(conn).map(|n| (t.name.clone(), n)))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;

        let failures: Vec<String> = results
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(name, n)| format!("{} ({} failing)", name, n))
            .collect();

        if !failures.is_empty() {
            warn!(failed = failures.len(), total = results.len(), "Data tests failed");
            return Err(CollaboratorError::TestFailures { failures });
        }

        info!(total = results.len(), "All data tests passed");
        Ok(StageOutput::materialized(
            results.len() as u64,
            format!("{} test(s) passed", results.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::warehouse::LifeExpectancyRow;
    use crate::domain::{RunId, Stage};
    use tempfile::TempDir;

    fn row(code: &str, year: i64, value: f64) -> LifeExpectancyRow {
        LifeExpectancyRow {
            country_name: code.to_string(),
            country_code: code.to_string(),
            year,
            sex: "SEX_BTSX".to_string(),
            life_expectancy: value,
        }
    }

    fn ctx(stage: Stage) -> StageContext {
        StageContext {
            run_id: RunId::generate(),
            stage,
            attempt: 1,
            upstream: None,
        }
    }

    #[tokio::test]
    async fn test_models_then_tests_pass() {
        let temp = TempDir::new().unwrap();
        let warehouse = Warehouse::new(temp.path().join("warehouse.db"));
        warehouse
            .load(vec![row("NOR", 2018, 82.8), row("NOR", 2019, 83.2), row("SWE", 2019, 82.4)])
            .await
            .unwrap();

        let output = SqlModels::new(warehouse.clone())
            .execute(&ctx(Stage::DbtRun))
            .await
            .unwrap();
        let StageOutput::Materialized { records, artifact, .. } = output else {
            panic!("models materialize");
        };
        assert_eq!(records, 3);
        assert_eq!(artifact.as_deref(), Some(MART_TABLE));

        let output = SqlTests::new(warehouse).execute(&ctx(Stage::DbtTest)).await.unwrap();
        let StageOutput::Materialized { records, .. } = output else {
            panic!("tests materialize");
        };
        assert_eq!(records, builtin_tests().len() as u64);
    }

    #[tokio::test]
    async fn test_tests_fail_without_mart() {
        let temp = TempDir::new().unwrap();
        let warehouse = Warehouse::new(temp.path().join("warehouse.db"));

        let err = SqlTests::new(warehouse).execute(&ctx(Stage::DbtTest)).await.unwrap_err();
        let CollaboratorError::TestFailures { failures } = err else {
            panic!("expected test failures");
        };
        assert!(failures.iter().any(|f| f.starts_with("row_count(health_life_expectancy)")));
        assert!(failures.iter().any(|f| f.starts_with("unique(mart_country_life_expectancy")));
    }

    #[tokio::test]
    async fn test_broken_model_reports_sql_error() {
        let temp = TempDir::new().unwrap();
        let warehouse = Warehouse::new(temp.path().join("warehouse.db"));
        let models = SqlModels::new(warehouse).with_models(vec![SqlModel {
            name: "broken",
            materialized: Materialization::Table,
            select: "SELECT missing_column FROM health_life_expectancy",
        }]);

        let err = models.execute(&ctx(Stage::DbtRun)).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Sql { model, .. } if model == "broken"));
    }
}

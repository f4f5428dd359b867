//! SQLite warehouse and the transform-stage loader.
//!
//! The loader reads the raw object landed by ingest, maps the WHO GHO
//! columns onto the canonical batch columns and hands the batch back
//! *staged*. Rows are only written by [`WarehouseLoader::commit`], after the
//! quality gate passed, as one full-refresh transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::core::CollaboratorError;
use crate::domain::batch::{CATEGORY, ENTITY_CODE, ENTITY_NAME, MEASURE_VALUE, PERIOD};
use crate::domain::{Batch, Record};

use super::object_store::LocalObjectStore;
use super::source::PayloadFormat;
use super::{Collaborator, StageContext, StageOutput};

/// Raw table written by transform
pub const RAW_TABLE: &str = "health_life_expectancy";

/// `Dim1` values meaning "both sexes" (CSV export, OData JSON)
pub const BOTH_SEXES: [&str; 2] = ["Both sexes", "SEX_BTSX"];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS health_life_expectancy (
    country_name    TEXT NOT NULL,
    country_code    TEXT NOT NULL,
    year            INTEGER NOT NULL,
    sex             TEXT NOT NULL,
    life_expectancy REAL NOT NULL,
    ingested_at     TEXT NOT NULL
);
";

/// A typed row of the raw table
#[derive(Debug, Clone, PartialEq)]
pub struct LifeExpectancyRow {
    pub country_name: String,
    pub country_code: String,
    pub year: i64,
    pub sex: String,
    pub life_expectancy: f64,
}

impl TryFrom<&Record> for LifeExpectancyRow {
    type Error = CollaboratorError;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        let field = |column: &str| {
            record
                .text(column)
                .ok_or_else(|| CollaboratorError::Schema(format!("missing '{}'", column)))
        };

        let country_code = field(ENTITY_CODE)?;
        let year = record
            .number(PERIOD)
            .filter(|y| y.fract() == 0.0)
            .ok_or_else(|| CollaboratorError::Schema(format!("'{}' is not a year", PERIOD)))?;
        let life_expectancy = record
            .number(MEASURE_VALUE)
            .ok_or_else(|| CollaboratorError::Schema(format!("'{}' is not numeric", MEASURE_VALUE)))?;

        Ok(Self {
            country_name: record.text(ENTITY_NAME).unwrap_or_else(|| country_code.clone()),
            country_code,
            year: year as i64,
            sex: field(CATEGORY)?,
            life_expectancy,
        })
    }
}

/// SQLite warehouse file
#[derive(Debug, Clone)]
pub struct Warehouse {
    path: PathBuf,
}

impl Warehouse {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection with the raw schema in place
    pub fn connect(&self) -> Result<Connection, CollaboratorError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Run blocking database work off the async runtime
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T, CollaboratorError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CollaboratorError> + Send + 'static,
        T: Send + 'static,
    {
        let warehouse = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = warehouse.connect()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CollaboratorError::Panicked(e.to_string()))?
    }

    /// Create the database file and schema
    pub async fn init(&self) -> Result<(), CollaboratorError> {
        self.with_connection(|_| Ok(())).await
    }

    /// Replace the raw table contents with `rows` in one transaction
    pub async fn load(&self, rows: Vec<LifeExpectancyRow>) -> Result<u64, CollaboratorError> {
        self.with_connection(move |conn| {
            let ingested_at = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
            let tx = conn.transaction()?;
            tx.execute(&format!("DELETE FROM {}", RAW_TABLE), [])?;
            {
                let mut insert = tx.prepare(&format!(
                    "INSERT INTO {} (country_name, country_code, year, sex, life_expectancy, ingested_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    RAW_TABLE
                ))?;
                for row in &rows {
                    insert.execute(params![
                        row.country_name,
                        row.country_code,
                        row.year,
                        row.sex,
                        row.life_expectancy,
                        ingested_at
                    ])?;
                }
            }
            tx.commit()?;
            Ok(rows.len() as u64)
        })
        .await
    }

    /// Row count of a table or view, `None` if it does not exist
    pub async fn count(&self, table: &str) -> Result<Option<u64>, CollaboratorError> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CollaboratorError::Schema(format!("invalid table name '{}'", table)));
        }
        let table = table.to_string();
        self.with_connection(move |conn| {
            if !relation_exists(conn, &table)? {
                return Ok(None);
            }
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(Some(count.max(0) as u64))
        })
        .await
    }

    /// The raw table read back as a batch under canonical column names
    pub async fn raw_batch(&self) -> Result<Batch, CollaboratorError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT country_name, country_code, year, sex, life_expectancy FROM {} ORDER BY rowid",
                RAW_TABLE
            ))?;
            let records = stmt
                .query_map([], |row| {
                    Ok(Record::new()
                        .with(ENTITY_NAME, row.get::<_, String>(0)?)
                        .with(ENTITY_CODE, row.get::<_, String>(1)?)
                        .with(PERIOD, row.get::<_, i64>(2)?)
                        .with(CATEGORY, row.get::<_, String>(3)?)
                        .with(MEASURE_VALUE, row.get::<_, f64>(4)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let columns = [ENTITY_NAME, ENTITY_CODE, PERIOD, CATEGORY, MEASURE_VALUE]
                .into_iter()
                .map(str::to_string)
                .collect();
            Ok(Batch::new(columns, records))
        })
        .await
    }
}

/// Whether a table or view exists
pub(crate) fn relation_exists(conn: &Connection, name: &str) -> Result<bool, CollaboratorError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Transform-stage collaborator: raw object in, staged batch out
pub struct WarehouseLoader {
    store: Arc<LocalObjectStore>,
    warehouse: Warehouse,
    dataset: String,
    max_rows: Option<usize>,
}

impl WarehouseLoader {
    pub fn new(store: Arc<LocalObjectStore>, warehouse: Warehouse, dataset: String) -> Self {
        Self {
            store,
            warehouse,
            dataset,
            max_rows: None,
        }
    }

    /// Cap the staged batch (quick development runs)
    pub fn with_max_rows(mut self, max_rows: Option<usize>) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Upstream artifact if ingest recorded one, else the newest object of the dataset
    async fn locate(&self, ctx: &StageContext) -> Result<String, CollaboratorError> {
        if let Some(key) = ctx.upstream_artifact() {
            return Ok(key.to_string());
        }
        self.store.latest(&self.dataset).await?.ok_or_else(|| {
            CollaboratorError::Schema(format!("no raw objects under '{}'", self.dataset))
        })
    }
}

#[async_trait]
impl Collaborator for WarehouseLoader {
    fn name(&self) -> &str {
        "warehouse-loader"
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, CollaboratorError> {
        let key = self.locate(ctx).await?;
        let bytes = self.store.get(&key).await?;
        info!(%key, size = bytes.len(), "Reading raw object");

        let rows = parse_rows(&bytes)?;
        let parsed = rows.len();
        let mut batch = Batch::from_records(
            rows.iter()
                .filter(|row| is_both_sexes(row))
                .map(to_record)
                .collect(),
        );
        debug!(parsed, kept = batch.len(), "Filtered to both sexes");

        if let Some(max) = self.max_rows {
            if batch.len() > max {
                batch.truncate(max);
                info!(max_rows = max, "Limited staged batch");
            }
        }

        Ok(StageOutput::Staged(batch))
    }

    async fn commit(&self, batch: Batch) -> Result<u64, CollaboratorError> {
        // Convert everything first so a bad row writes nothing
        let rows = batch
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                LifeExpectancyRow::try_from(record).map_err(|e| {
                    CollaboratorError::Schema(format!("record {}: {}", idx, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let written = self.warehouse.load(rows).await?;
        info!(rows = written, table = RAW_TABLE, "Loaded warehouse table");
        Ok(written)
    }
}

/// Parse a raw payload into source rows (OData JSON or CSV)
pub fn parse_rows(bytes: &[u8]) -> Result<Vec<Map<String, Value>>, CollaboratorError> {
    match PayloadFormat::detect(bytes) {
        PayloadFormat::Json => {
            let doc: Value = serde_json::from_slice(bytes)
                .map_err(|e| CollaboratorError::Schema(format!("invalid JSON payload: {}", e)))?;
            let rows = match doc {
                Value::Array(rows) => rows,
                Value::Object(mut obj) => match obj.remove("value") {
                    Some(Value::Array(rows)) => rows,
                    _ => {
                        return Err(CollaboratorError::Schema(
                            "JSON payload has no 'value' array".to_string(),
                        ))
                    }
                },
                _ => {
                    return Err(CollaboratorError::Schema(
                        "JSON payload is not an object or array".to_string(),
                    ))
                }
            };
            // Non-object rows become empty records and fail the quality checks
            Ok(rows
                .into_iter()
                .map(|row| match row {
                    Value::Object(map) => map,
                    _ => Map::new(),
                })
                .collect())
        }
        PayloadFormat::Csv => {
            let mut reader = csv::Reader::from_reader(bytes);
            let headers = reader
                .headers()
                .map_err(|e| CollaboratorError::Schema(format!("invalid CSV header: {}", e)))?
                .clone();

            let mut rows = Vec::new();
            for result in reader.records() {
                let record = result
                    .map_err(|e| CollaboratorError::Schema(format!("invalid CSV row: {}", e)))?;
                let row = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
                    .collect();
                rows.push(row);
            }
            Ok(rows)
        }
    }
}

fn is_both_sexes(row: &Map<String, Value>) -> bool {
    matches!(row.get("Dim1"), Some(Value::String(s)) if BOTH_SEXES.contains(&s.as_str()))
}

/// Map WHO GHO columns onto canonical names. OData JSON has no separate
/// `SpatialDimCode`, so `SpatialDim` stands in for both name and code.
fn to_record(row: &Map<String, Value>) -> Record {
    let mut record = Record::new();
    let code = row.get("SpatialDimCode").or_else(|| row.get("SpatialDim"));
    let name = row.get("SpatialDim").or_else(|| row.get("SpatialDimCode"));

    for (column, value) in [
        (ENTITY_NAME, name),
        (ENTITY_CODE, code),
        (PERIOD, row.get("TimeDim")),
        (CATEGORY, row.get("Dim1")),
        (MEASURE_VALUE, row.get("NumericValue")),
    ] {
        if let Some(value) = value {
            record = record.with(column, value.clone());
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunId, Stage, StageExecution};
    use tempfile::TempDir;

    const ODATA: &str = r#"{
        "@odata.context": "https://ghoapi.azureedge.net/api/$metadata#WHOSIS_000001",
        "value": [
            {"SpatialDim": "NOR", "TimeDim": 2019, "Dim1": "SEX_BTSX", "NumericValue": 83.2},
            {"SpatialDim": "NOR", "TimeDim": 2019, "Dim1": "SEX_FMLE", "NumericValue": 84.9},
            {"SpatialDim": "SWE", "TimeDim": 2019, "Dim1": "SEX_BTSX", "NumericValue": 82.4},
            {"SpatialDim": "FIN", "TimeDim": 2019, "Dim1": "SEX_BTSX", "NumericValue": 81.6}
        ]
    }"#;

    fn setup() -> (Arc<LocalObjectStore>, Warehouse, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(temp.path().join("raw-health-data")));
        let warehouse = Warehouse::new(temp.path().join("warehouse.db"));
        (store, warehouse, temp)
    }

    fn ctx_with_artifact(key: &str) -> StageContext {
        let run_id = RunId::generate();
        StageContext {
            run_id,
            stage: Stage::Transform,
            attempt: 1,
            upstream: Some(StageExecution::started(run_id, Stage::Ingest, 1).succeed(
                4,
                Some(key.to_string()),
                "ok".to_string(),
            )),
        }
    }

    #[test]
    fn test_parse_csv_rows() {
        let csv = "SpatialDim,SpatialDimCode,TimeDim,Dim1,NumericValue\n\
                   Norway,NOR,2019,Both sexes,83.2\n\
                   Norway,NOR,2019,Female,84.9\n";
        let rows = parse_rows(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);

        let kept: Vec<Record> = rows.iter().filter(|r| is_both_sexes(r)).map(to_record).collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].text(ENTITY_NAME).as_deref(), Some("Norway"));
        assert_eq!(kept[0].text(ENTITY_CODE).as_deref(), Some("NOR"));
        assert_eq!(kept[0].number(MEASURE_VALUE), Some(83.2));
    }

    #[test]
    fn test_parse_rejects_shapeless_json() {
        assert!(parse_rows(br#"{"rows": []}"#).is_err());
        assert!(parse_rows(b"{not json").is_err());
        assert!(parse_rows(br#"{"value": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_row_conversion() {
        let record = Record::new()
            .with(ENTITY_CODE, "NOR")
            .with(PERIOD, "2019")
            .with(CATEGORY, "SEX_BTSX")
            .with(MEASURE_VALUE, 83.2);
        let row = LifeExpectancyRow::try_from(&record).unwrap();
        assert_eq!(row.country_name, "NOR");
        assert_eq!(row.year, 2019);

        let bad = record.clone().with(PERIOD, "2019.5");
        assert!(LifeExpectancyRow::try_from(&bad).is_err());
    }

    #[tokio::test]
    async fn test_stage_and_commit() {
        let (store, warehouse, _temp) = setup();
        let key = "who_life_expectancy/ingestion_date=2024-05-01/life_expectancy.json";
        store.put(key, ODATA.as_bytes().to_vec()).await.unwrap();

        let loader = WarehouseLoader::new(store, warehouse.clone(), "who_life_expectancy".to_string());
        let StageOutput::Staged(batch) = loader.execute(&ctx_with_artifact(key)).await.unwrap() else {
            panic!("transform stages its batch");
        };
        assert_eq!(batch.len(), 3);

        // Nothing is written until commit
        assert_eq!(warehouse.count(RAW_TABLE).await.unwrap(), Some(0));

        assert_eq!(loader.commit(batch).await.unwrap(), 3);
        assert_eq!(warehouse.count(RAW_TABLE).await.unwrap(), Some(3));

        let raw = warehouse.raw_batch().await.unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw.records[0].text(ENTITY_CODE).as_deref(), Some("NOR"));
    }

    #[tokio::test]
    async fn test_commit_is_full_refresh() {
        let (store, warehouse, _temp) = setup();
        let loader = WarehouseLoader::new(store, warehouse.clone(), "who".to_string());
        let batch = Batch::from_records(vec![Record::new()
            .with(ENTITY_CODE, "NOR")
            .with(PERIOD, 2019)
            .with(CATEGORY, "SEX_BTSX")
            .with(MEASURE_VALUE, 83.2)]);

        loader.commit(batch.clone()).await.unwrap();
        loader.commit(batch).await.unwrap();
        assert_eq!(warehouse.count(RAW_TABLE).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_bad_row_writes_nothing() {
        let (store, warehouse, _temp) = setup();
        let loader = WarehouseLoader::new(store, warehouse.clone(), "who".to_string());
        let good = Record::new()
            .with(ENTITY_CODE, "NOR")
            .with(PERIOD, 2019)
            .with(CATEGORY, "SEX_BTSX")
            .with(MEASURE_VALUE, 83.2);
        let bad = good.clone().with(MEASURE_VALUE, "n/a");

        assert!(loader.commit(Batch::from_records(vec![good, bad])).await.is_err());
        assert_eq!(warehouse.count(RAW_TABLE).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_max_rows_and_latest_object() {
        let (store, warehouse, _temp) = setup();
        store
            .put("who/ingestion_date=2024-05-01/life_expectancy.json", ODATA.as_bytes().to_vec())
            .await
            .unwrap();

        let loader = WarehouseLoader::new(store, warehouse, "who".to_string()).with_max_rows(Some(2));
        let ctx = StageContext {
            run_id: RunId::generate(),
            stage: Stage::Transform,
            attempt: 1,
            upstream: None,
        };

        let StageOutput::Staged(batch) = loader.execute(&ctx).await.unwrap() else {
            panic!("transform stages its batch");
        };
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_table_counts_none() {
        let (_store, warehouse, _temp) = setup();
        assert_eq!(warehouse.count("mart_country_life_expectancy").await.unwrap(), None);
        assert!(warehouse.count("x; DROP TABLE y").await.is_err());
    }
}

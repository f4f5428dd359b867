//! Train-stage collaborator.
//!
//! Reads the country/year mart, refuses to train on too few rows, then
//! either runs the configured training command or fits the built-in
//! candidates (a global year trend, per-country means, and a year trend with
//! per-country offsets) and keeps the one with the best holdout R2. The
//! winner is written with every candidate's scores to
//! `<models_dir>/<run_id>/model.json`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::CollaboratorError;
use crate::domain::RunId;

use super::command::CommandCollaborator;
use super::models::MART_TABLE;
use super::warehouse::{relation_exists, Warehouse};
use super::{Collaborator, StageContext, StageOutput};

/// Training needs at least this many mart rows by default
pub const DEFAULT_MIN_ROWS: u64 = 10;

/// One training example
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub country_code: String,
    pub year: i64,
    pub value: f64,
}

/// Holdout metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub mse: f64,
    pub mae: f64,
    pub r2: f64,
    pub train_rows: usize,
    pub test_rows: usize,
}

/// Year trend plus per-country offsets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendModel {
    pub slope_per_year: f64,
    /// Intercept for countries not seen in training
    pub default_intercept: f64,
    pub intercepts: BTreeMap<String, f64>,
}

impl TrendModel {
    /// Least squares with country fixed effects: the slope is estimated from
    /// within-country deviations, the intercepts from country means.
    pub fn fit(data: &[Observation]) -> Self {
        let mut groups: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
        for obs in data {
            groups.entry(obs.country_code.as_str()).or_default().push(obs);
        }

        let means: BTreeMap<&str, (f64, f64)> = groups
            .iter()
            .map(|(code, rows)| {
                let n = rows.len() as f64;
                let year = rows.iter().map(|o| o.year as f64).sum::<f64>() / n;
                let value = rows.iter().map(|o| o.value).sum::<f64>() / n;
                (*code, (year, value))
            })
            .collect();

        let (mut sxy, mut sxx) = (0.0, 0.0);
        for obs in data {
            let Some(&(my, mv)) = means.get(obs.country_code.as_str()) else {
                continue;
            };
            let dx = obs.year as f64 - my;
            sxy += dx * (obs.value - mv);
            sxx += dx * dx;
        }
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };

        let intercepts: BTreeMap<String, f64> = means
            .iter()
            .map(|(code, (my, mv))| (code.to_string(), mv - slope * my))
            .collect();
        let default_intercept = if intercepts.is_empty() {
            0.0
        } else {
            intercepts.values().sum::<f64>() / intercepts.len() as f64
        };

        Self {
            slope_per_year: slope,
            default_intercept,
            intercepts,
        }
    }

    pub fn predict(&self, country_code: &str, year: i64) -> f64 {
        let intercept = self
            .intercepts
            .get(country_code)
            .copied()
            .unwrap_or(self.default_intercept);
        intercept + self.slope_per_year * year as f64
    }
}

/// A fitted regressor over (country, year)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "model_type", rename_all = "snake_case")]
pub enum Model {
    /// One line for every country
    YearTrend { intercept: f64, slope_per_year: f64 },

    /// Per-country level, ignoring the year
    CountryMean {
        default_mean: f64,
        means: BTreeMap<String, f64>,
    },

    CountryYearTrend(TrendModel),
}

impl Model {
    /// Fit every candidate on the same training rows, simplest first
    pub fn fit_candidates(data: &[Observation]) -> Vec<Self> {
        vec![
            Self::fit_year_trend(data),
            Self::fit_country_mean(data),
            Self::CountryYearTrend(TrendModel::fit(data)),
        ]
    }

    fn fit_year_trend(data: &[Observation]) -> Self {
        let n = data.len().max(1) as f64;
        let my = data.iter().map(|o| o.year as f64).sum::<f64>() / n;
        let mv = data.iter().map(|o| o.value).sum::<f64>() / n;

        let (mut sxy, mut sxx) = (0.0, 0.0);
        for obs in data {
            let dx = obs.year as f64 - my;
            sxy += dx * (obs.value - mv);
            sxx += dx * dx;
        }
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };

        Self::YearTrend {
            intercept: mv - slope * my,
            slope_per_year: slope,
        }
    }

    fn fit_country_mean(data: &[Observation]) -> Self {
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for obs in data {
            let entry = sums.entry(obs.country_code.clone()).or_insert((0.0, 0));
            entry.0 += obs.value;
            entry.1 += 1;
        }
        let default_mean = data.iter().map(|o| o.value).sum::<f64>() / data.len().max(1) as f64;

        Self::CountryMean {
            default_mean,
            means: sums
                .into_iter()
                .map(|(code, (sum, count))| (code, sum / count as f64))
                .collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::YearTrend { .. } => "year_trend",
            Self::CountryMean { .. } => "country_mean",
            Self::CountryYearTrend(_) => "country_year_trend",
        }
    }

    pub fn predict(&self, country_code: &str, year: i64) -> f64 {
        match self {
            Self::YearTrend {
                intercept,
                slope_per_year,
            } => intercept + slope_per_year * year as f64,
            Self::CountryMean {
                default_mean,
                means,
            } => means.get(country_code).copied().unwrap_or(*default_mean),
            Self::CountryYearTrend(trend) => trend.predict(country_code, year),
        }
    }

    pub fn evaluate(&self, test: &[Observation], train_rows: usize) -> Metrics {
        let n = test.len().max(1) as f64;
        let mean = test.iter().map(|o| o.value).sum::<f64>() / n;

        let (mut sse, mut sae, mut sst) = (0.0, 0.0, 0.0);
        for obs in test {
            let err = obs.value - self.predict(&obs.country_code, obs.year);
            sse += err * err;
            sae += err.abs();
            sst += (obs.value - mean).powi(2);
        }

        Metrics {
            mse: sse / n,
            mae: sae / n,
            r2: if sst > 0.0 { 1.0 - sse / sst } else { 0.0 },
            train_rows,
            test_rows: test.len(),
        }
    }
}

/// Holdout score of one candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateScore {
    pub model_type: String,
    pub metrics: Metrics,
}

/// Candidate with the highest R2; the earlier (simpler) one wins a tie
pub fn select_best(scored: Vec<(Model, Metrics)>) -> Option<(Model, Metrics)> {
    let mut best: Option<(Model, Metrics)> = None;
    for (model, metrics) in scored {
        if best.as_ref().map_or(true, |(_, kept)| metrics.r2 > kept.r2) {
            best = Some((model, metrics));
        }
    }
    best
}

/// Deterministic split: every `every`-th observation is held out
pub fn split(data: &[Observation], every: usize) -> (Vec<Observation>, Vec<Observation>) {
    let every = every.max(2);
    let (test, train): (Vec<_>, Vec<_>) = data
        .iter()
        .cloned()
        .enumerate()
        .partition(|(idx, _)| idx % every == every - 1);
    (
        train.into_iter().map(|(_, o)| o).collect(),
        test.into_iter().map(|(_, o)| o).collect(),
    )
}

/// The model artifact written by the baseline trainer
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub run_id: RunId,
    pub trained_at: chrono::DateTime<chrono::Utc>,
    pub source_table: String,

    /// The selected candidate and its holdout metrics
    pub model: Model,
    pub metrics: Metrics,

    /// Every candidate, in fitting order
    pub candidates: Vec<CandidateScore>,
}

/// Train-stage collaborator
pub struct TrainCollaborator {
    warehouse: Warehouse,
    models_dir: PathBuf,
    command: Option<CommandCollaborator>,
    min_rows: u64,
    holdout_every: usize,
}

impl TrainCollaborator {
    pub fn new(warehouse: Warehouse, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            warehouse,
            models_dir: models_dir.into(),
            command: None,
            min_rows: DEFAULT_MIN_ROWS,
            holdout_every: 5,
        }
    }

    /// Delegate training to an external command instead of the baseline
    pub fn with_command(mut self, command: Option<CommandCollaborator>) -> Self {
        self.command = command;
        self
    }

    pub fn with_min_rows(mut self, min_rows: u64) -> Self {
        self.min_rows = min_rows;
        self
    }

    pub fn with_holdout_every(mut self, every: usize) -> Self {
        self.holdout_every = every;
        self
    }

    async fn load(&self) -> Result<Vec<Observation>, CollaboratorError> {
        self.warehouse
            .with_connection(|conn| {
                if !relation_exists(conn, MART_TABLE)? {
                    return Err(CollaboratorError::Sql {
                        model: MART_TABLE.to_string(),
                        message: "table does not exist; run dbt-run first".to_string(),
                    });
                }
                let mut stmt = conn.prepare(&format!(
                    "SELECT country_code, year, avg_life_expectancy FROM {}
                     WHERE avg_life_expectancy IS NOT NULL ORDER BY country_code, year",
                    MART_TABLE
                ))?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(Observation {
                            country_code: row.get(0)?,
                            year: row.get(1)?,
                            value: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn write_artifact(&self, artifact: &ModelArtifact) -> Result<PathBuf, CollaboratorError> {
        let dir = self.models_dir.join(artifact.run_id.to_string());
        let path = dir.join("model.json");
        let json = serde_json::to_vec_pretty(artifact)
            .map_err(|e| CollaboratorError::Write(e.to_string()))?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&json)?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| CollaboratorError::Panicked(e.to_string()))??;

        Ok(path)
    }
}

#[async_trait]
impl Collaborator for TrainCollaborator {
    fn name(&self) -> &str {
        "train"
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, CollaboratorError> {
        let data = self.load().await?;
        let rows = data.len() as u64;
        if rows < self.min_rows {
            return Err(CollaboratorError::InsufficientRows {
                table: MART_TABLE.to_string(),
                rows,
                required: self.min_rows,
            });
        }

        if let Some(ref command) = self.command {
            let env = [
                ("HEALTHPIPE_WAREHOUSE", self.warehouse.path().display().to_string()),
                ("HEALTHPIPE_MART_TABLE", MART_TABLE.to_string()),
            ];
            let output = command.run(ctx, &env).await?;
            let summary = output
                .last_line()
                .map(str::to_string)
                .unwrap_or_else(|| format!("'{}' trained on {} rows", command.spec().display(), rows));
            return Ok(StageOutput::materialized(rows, summary));
        }

        let (train, test) = split(&data, self.holdout_every);
        let scored: Vec<(Model, Metrics)> = Model::fit_candidates(&train)
            .into_iter()
            .map(|model| {
                let metrics = model.evaluate(&test, train.len());
                info!(
                    model = model.name(),
                    r2 = metrics.r2,
                    mse = metrics.mse,
                    mae = metrics.mae,
                    "Candidate evaluated"
                );
                (model, metrics)
            })
            .collect();
        let candidates: Vec<CandidateScore> = scored
            .iter()
            .map(|(model, metrics)| CandidateScore {
                model_type: model.name().to_string(),
                metrics: metrics.clone(),
            })
            .collect();

        let (model, metrics) = select_best(scored).ok_or_else(|| {
            CollaboratorError::InsufficientRows {
                table: MART_TABLE.to_string(),
                rows,
                required: self.min_rows,
            }
        })?;
        info!(
            model = model.name(),
            r2 = metrics.r2,
            train_rows = metrics.train_rows,
            test_rows = metrics.test_rows,
            "Best model by R2"
        );

        let artifact = ModelArtifact {
            run_id: ctx.run_id,
            trained_at: chrono::Utc::now(),
            source_table: MART_TABLE.to_string(),
            model,
            metrics,
            candidates,
        };
        let path = self.write_artifact(&artifact).await?;

        Ok(StageOutput::Materialized {
            records: rows,
            artifact: Some(path.display().to_string()),
            summary: format!(
                "Trained {} (best of {} by R2) on {} rows (R2 {:.2}, MAE {:.2} years)",
                artifact.model.name(),
                artifact.candidates.len(),
                rows,
                artifact.metrics.r2,
                artifact.metrics.mae
            ),
        })
    }
}

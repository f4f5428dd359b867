//! Configuration for healthpipe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (HEALTHPIPE_HOME, HEALTHPIPE_SOURCE_URL, HEALTHPIPE_MAX_ROWS)
//! 2. Config file (.healthpipe/config.yaml)
//! 3. Defaults (~/.healthpipe)
//!
//! Config file discovery:
//! - Searches current directory and parents for .healthpipe/config.yaml
//! - `paths.home` is relative to the .healthpipe/ directory
//! - The other paths are relative to home

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::command::CommandSpec;
use crate::adapters::source::DEFAULT_SOURCE_URL;
use crate::adapters::train::DEFAULT_MIN_ROWS;
use crate::core::{QualityRules, RetryPolicy, StageLimits};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".healthpipe";
const CONFIG_FILE: &str = "config.yaml";

/// Config schema version this build understands
const CONFIG_VERSION: &str = "1.0";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub quality: QualityRules,
    #[serde(default)]
    pub stages: StageLimits,
    #[serde(default)]
    pub train: TrainSettings,
    #[serde(default)]
    pub infra: InfraSettings,
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            paths: PathsConfig::default(),
            source: SourceSettings::default(),
            quality: QualityRules::default(),
            stages: StageLimits::default(),
            train: TrainSettings::default(),
            infra: InfraSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .healthpipe/)
    pub home: Option<String>,
    /// Object store bucket directory (relative to home)
    pub object_store: Option<String>,
    /// Warehouse database file (relative to home)
    pub warehouse: Option<String>,
    /// Trained model output directory (relative to home)
    pub models: Option<String>,
}

/// Where the dataset comes from and how it is fetched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(default = "default_source_url")]
    pub url: String,

    /// Prefix of the raw objects in the bucket
    #[serde(default = "default_dataset")]
    pub dataset: String,

    /// Bucket directory name under home when `paths.object_store` is unset
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Cap on rows carried into the warehouse (unset means all)
    #[serde(default)]
    pub max_rows: Option<usize>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_source_url() -> String {
    DEFAULT_SOURCE_URL.to_string()
}
fn default_dataset() -> String {
    "who_life_expectancy".to_string()
}
fn default_bucket() -> String {
    "raw-health-data".to_string()
}
fn default_request_timeout() -> u64 {
    60
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: default_source_url(),
            dataset: default_dataset(),
            bucket: default_bucket(),
            max_rows: None,
            request_timeout_seconds: default_request_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SourceSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Training stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainSettings {
    /// External training command; the built-in baseline runs when unset
    #[serde(default)]
    pub command: Option<CommandSpec>,

    #[serde(default = "default_min_rows")]
    pub min_rows: u64,

    /// Every n-th observation is held out for evaluation
    #[serde(default = "default_holdout_every")]
    pub holdout_every: usize,
}

fn default_min_rows() -> u64 {
    DEFAULT_MIN_ROWS
}
fn default_holdout_every() -> usize {
    5
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            command: None,
            min_rows: default_min_rows(),
            holdout_every: default_holdout_every(),
        }
    }
}

/// Hooks run by `up` and `down` after the local setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraSettings {
    #[serde(default)]
    pub up: Option<CommandSpec>,
    #[serde(default)]
    pub down: Option<CommandSpec>,
    #[serde(default = "default_infra_timeout")]
    pub timeout_seconds: u64,
}

fn default_infra_timeout() -> u64 {
    300
}

impl Default for InfraSettings {
    fn default() -> Self {
        Self {
            up: None,
            down: None,
            timeout_seconds: default_infra_timeout(),
        }
    }
}

impl InfraSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory (ledger, warehouse, bucket)
    pub home: PathBuf,
    /// Local bucket holding raw payloads
    pub object_store: PathBuf,
    /// SQLite warehouse file
    pub warehouse: PathBuf,
    /// Trained model output directory
    pub models: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub source: SourceSettings,
    pub quality: QualityRules,
    pub stages: StageLimits,
    pub train: TrainSettings,
    pub infra: InfraSettings,
}

impl ResolvedConfig {
    /// Run ledger directory ($HEALTHPIPE_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.models.clone()
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed file, environment overrides and the default home
fn resolve(
    config_path: Option<PathBuf>,
    file: ConfigFile,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    if file.version != CONFIG_VERSION {
        anyhow::bail!(
            "Unsupported config version '{}' (expected '{}')",
            file.version,
            CONFIG_VERSION
        );
    }

    let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    let home = if let Some(env_home) = var("HEALTHPIPE_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (&file.paths.home, &config_path) {
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let under_home = |configured: &Option<String>, default: &str| match configured {
        Some(p) => resolve_path(&home, p),
        None => home.join(default),
    };
    let object_store = under_home(&file.paths.object_store, &file.source.bucket);
    let warehouse = under_home(&file.paths.warehouse, "warehouse.db");
    let models = under_home(&file.paths.models, "models");

    let mut source = file.source;
    if let Some(url) = var("HEALTHPIPE_SOURCE_URL") {
        source.url = url;
    }
    if let Some(max_rows) = var("HEALTHPIPE_MAX_ROWS") {
        let n = max_rows
            .trim()
            .parse::<usize>()
            .with_context(|| format!("Invalid HEALTHPIPE_MAX_ROWS: '{}'", max_rows))?;
        source.max_rows = Some(n);
    }

    file.stages.validate()?;
    if file.train.holdout_every < 2 {
        anyhow::bail!("train.holdout_every must be at least 2");
    }

    Ok(ResolvedConfig {
        home,
        object_store,
        warehouse,
        models,
        config_file: config_path,
        source,
        quality: file.quality,
        stages: file.stages,
        train: file.train,
        infra: file.infra,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    resolve(config_file, file, |key| std::env::var(key).ok(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Stage;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let home = PathBuf::from("/data/.healthpipe");
        let config = resolve(None, ConfigFile::default(), no_env, home.clone()).unwrap();

        assert_eq!(config.home, home);
        assert_eq!(config.object_store, home.join("raw-health-data"));
        assert_eq!(config.warehouse, home.join("warehouse.db"));
        assert_eq!(config.runs_dir(), home.join("runs"));
        assert_eq!(config.models_dir(), home.join("models"));
        assert_eq!(config.source.url, DEFAULT_SOURCE_URL);
        assert_eq!(config.source.dataset, "who_life_expectancy");
        assert!(config.source.max_rows.is_none());
        assert!(config.train.command.is_none());
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join(CONFIG_FILE);
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
  warehouse: lake/warehouse.db
source:
  url: http://localhost:8080/gho
  max_rows: 500
  retry:
    max_attempts: 5
quality:
  max_measure: 100.0
stages:
  stage_timeout_seconds: 60
  timeouts:
    train: 600
train:
  command:
    program: python
    args: [ml/train.py]
  min_rows: 50
infra:
  up:
    program: docker
    args: [compose, up, -d]
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version, "1.0");
        assert_eq!(parsed.paths.home, Some("./state".to_string()));

        let config = resolve(Some(config_path.clone()), parsed, no_env, PathBuf::from("/unused")).unwrap();
        let home = config_dir.join("state");
        assert_eq!(config.home, home);
        assert_eq!(config.warehouse, home.join("lake/warehouse.db"));
        assert_eq!(config.object_store, home.join("raw-health-data"));
        assert_eq!(config.source.url, "http://localhost:8080/gho");
        assert_eq!(config.source.max_rows, Some(500));
        assert_eq!(config.source.retry.max_attempts, 5);
        assert_eq!(config.quality.max_measure, 100.0);
        assert_eq!(config.stages.timeout(Stage::Ingest), Duration::from_secs(60));
        assert_eq!(config.stages.timeout(Stage::Train), Duration::from_secs(600));
        assert_eq!(config.train.min_rows, 50);
        assert_eq!(config.train.command.unwrap().display(), "python ml/train.py");
        assert_eq!(config.infra.up.unwrap().display(), "docker compose up -d");
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HEALTHPIPE_HOME", "/srv/healthpipe"),
            ("HEALTHPIPE_SOURCE_URL", "http://mirror/gho"),
            ("HEALTHPIPE_MAX_ROWS", "25"),
        ]
        .into_iter()
        .collect();

        let config = resolve(
            None,
            ConfigFile::default(),
            |k| env.get(k).map(|v| v.to_string()),
            PathBuf::from("/unused"),
        )
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/healthpipe"));
        assert_eq!(config.warehouse, PathBuf::from("/srv/healthpipe/warehouse.db"));
        assert_eq!(config.source.url, "http://mirror/gho");
        assert_eq!(config.source.max_rows, Some(25));
    }

    #[test]
    fn test_invalid_max_rows_env() {
        let err = resolve(
            None,
            ConfigFile::default(),
            |k| (k == "HEALTHPIPE_MAX_ROWS").then(|| "lots".to_string()),
            PathBuf::from("/tmp"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("HEALTHPIPE_MAX_ROWS"));
    }

    #[test]
    fn test_timeout_beyond_reconciliation_window_rejected() {
        let mut file = ConfigFile::default();
        file.stages.stage_timeout_seconds = file.stages.max_stage_duration_seconds + 1;

        assert!(resolve(None, file, no_env, PathBuf::from("/tmp")).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }

    #[test]
    fn test_unknown_version_rejected() {
        let file: ConfigFile = serde_yaml::from_str("version: \"2.0\"\n").unwrap();
        let err = resolve(None, file, no_env, PathBuf::from("/data")).unwrap_err();
        assert!(err.to_string().contains("Unsupported config version '2.0'"));

        let file: ConfigFile = serde_yaml::from_str("source:\n  max_rows: 10\n").unwrap();
        assert_eq!(file.version, CONFIG_VERSION);
        assert!(resolve(None, file, no_env, PathBuf::from("/data")).is_ok());
    }
}

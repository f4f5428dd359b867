//! Command-line interface for healthpipe.
//!
//! Provides one command per stage, the full pipeline, local setup and
//! teardown, and inspection of the run ledger.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::adapters::command::run_command;
use crate::adapters::{Collaborators, LocalObjectStore, Warehouse};
use crate::config::{self, ResolvedConfig};
use crate::core::quality::blocking_failures;
use crate::core::{validate, CancellationToken, Orchestrator, RunLedger, RunnerError, StageRunner};
use crate::domain::{RunId, Stage, StageExecution};

/// Exit code for a stage or run that did not succeed
const EXIT_FAILED: i32 = 1;

/// Exit code when the stage is already being executed elsewhere
const EXIT_CONFLICT: i32 = 2;

/// healthpipe - Quality-gated batch pipeline for WHO health statistics
#[derive(Parser, Debug)]
#[command(name = "healthpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the state directory, bucket and warehouse, then run the infra.up hook
    Up,

    /// Run the infra.down hook (no data is deleted)
    Down,

    /// Fetch the source dataset into the object store
    Ingest {
        /// Run to attach to (default: a new run)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Validate the raw payload and load it into the warehouse
    Transform {
        /// Run to attach to (default: most recent run)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Build the analytics models
    DbtRun {
        /// Run to attach to (default: most recent run)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Run the declared data tests
    DbtTest {
        /// Run to attach to (default: most recent run)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Train the model on the mart table
    Ml {
        /// Run to attach to (default: most recent run)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Run all stages in order
    Pipeline {
        /// Resume an unfinished run instead of starting a new one
        #[arg(long)]
        run_id: Option<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the quality of the warehouse's current raw table
    Test,

    /// Show the stage executions of a run
    Logs {
        /// Run ID (default: most recent run)
        run_id: Option<String>,

        /// One JSON record per line
        #[arg(long)]
        json: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Up => up().await,
            Commands::Down => down().await,
            Commands::Ingest { run_id } => run_single_stage(Stage::Ingest, run_id).await,
            Commands::Transform { run_id } => run_single_stage(Stage::Transform, run_id).await,
            Commands::DbtRun { run_id } => run_single_stage(Stage::DbtRun, run_id).await,
            Commands::DbtTest { run_id } => run_single_stage(Stage::DbtTest, run_id).await,
            Commands::Ml { run_id } => run_single_stage(Stage::Train, run_id).await,
            Commands::Pipeline { run_id, json } => run_pipeline(run_id, json).await,
            Commands::Test => test_raw_table().await,
            Commands::Logs { run_id, json } => show_logs(run_id, json).await,
            Commands::Status { run_id, json } => show_status(&run_id, json).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Wire the ledger, collaborators and runner from configuration
fn build_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let ledger = RunLedger::open(cfg.runs_dir(), cfg.stages.max_stage_duration())
        .context("Failed to open run ledger")?;
    let collaborators = Collaborators::from_config(cfg)?;

    let runner = StageRunner::new(ledger, collaborators)
        .with_rules(cfg.quality.clone())
        .with_limits(cfg.stages.clone());
    Ok(Orchestrator::new(runner))
}

fn parse_run_id(s: &str) -> Result<RunId> {
    s.parse()
        .with_context(|| format!("Invalid run ID: {}", s))
}

/// Explicit run, else the most recent one
async fn resolve_run_id(ledger: &RunLedger, run_id: Option<String>) -> Result<RunId> {
    match run_id {
        Some(s) => parse_run_id(&s),
        None => ledger
            .latest_run()
            .await?
            .context("No runs found. Use 'healthpipe ingest' or 'healthpipe pipeline' to start one"),
    }
}

/// Create local state, then run the infra.up hook
async fn up() -> Result<()> {
    let cfg = config::config()?;

    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create {}", cfg.home.display()))?;
    RunLedger::open(cfg.runs_dir(), cfg.stages.max_stage_duration())?;

    let store = LocalObjectStore::new(cfg.object_store.clone());
    if store.ensure_bucket().await? {
        eprintln!("Created bucket: {}", store.bucket().display());
    } else {
        eprintln!("Bucket exists: {}", store.bucket().display());
    }

    Warehouse::new(cfg.warehouse.clone()).init().await?;
    eprintln!("Warehouse ready: {}", cfg.warehouse.display());

    if let Some(spec) = &cfg.infra.up {
        eprintln!("Running: {}", spec.display());
        let output = run_command(spec, &[], Some(cfg.infra.timeout())).await?;
        if let Some(line) = output.last_line() {
            eprintln!("{}", line);
        }
    }

    Ok(())
}

/// Run the infra.down hook
async fn down() -> Result<()> {
    let cfg = config::config()?;

    match &cfg.infra.down {
        Some(spec) => {
            eprintln!("Running: {}", spec.display());
            run_command(spec, &[], Some(cfg.infra.timeout())).await?;
            eprintln!("Infrastructure stopped; data under {} is kept", cfg.home.display());
        }
        None => eprintln!("No infra.down command configured; nothing to stop"),
    }

    Ok(())
}

/// Exactly one stage runner invocation
async fn run_single_stage(stage: Stage, run_id: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;

    let run_id = match run_id {
        None if stage == Stage::Ingest => Orchestrator::new_run_id(),
        other => resolve_run_id(orchestrator.ledger(), other).await?,
    };

    match orchestrator.run_stage(stage, run_id).await {
        Ok(execution) => {
            print_execution(&execution);
            if !execution.is_succeeded() {
                std::process::exit(EXIT_FAILED);
            }
            Ok(())
        }
        Err(e @ RunnerError::ConcurrencyConflict { .. }) => {
            eprintln!("[{}]", e);
            std::process::exit(EXIT_CONFLICT);
        }
        Err(e) => Err(e.into()),
    }
}

fn print_execution(execution: &StageExecution) {
    println!("Run: {}", execution.run_id);
    println!(
        "Stage: {} (attempt {}) {}",
        execution.stage, execution.attempt, execution.outcome
    );
    println!("Records: {}", execution.records);
    if !execution.summary.is_empty() {
        println!("Summary: {}", execution.summary);
    }
    if let Some(ref failure) = execution.failure {
        println!("Failure: {}", failure);
    }
    print_quality_failures(execution, "  ");
}

fn print_quality_failures(execution: &StageExecution, indent: &str) {
    const SHOWN: usize = 10;

    for result in execution.quality_failures.iter().take(SHOWN) {
        let at = result
            .record_index
            .map(|i| format!(" [record {}]", i))
            .unwrap_or_default();
        println!(
            "{}{:?} {}{}: {}",
            indent, result.severity, result.check, at, result.detail
        );
    }
    if execution.quality_failures.len() > SHOWN {
        println!(
            "{}... and {} more",
            indent,
            execution.quality_failures.len() - SHOWN
        );
    }
}

/// Exactly one orchestrator invocation over all stages
async fn run_pipeline(run_id: Option<String>, json: bool) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;

    let run_id = match run_id {
        Some(s) => parse_run_id(&s)?,
        None => Orchestrator::new_run_id(),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; the current stage will finish and the rest are skipped");
            on_interrupt.cancel("interrupted");
        }
    });

    if let Err(e) = orchestrator.execute_with_cancel(run_id, &cancel).await {
        if let Some(conflict @ RunnerError::ConcurrencyConflict { .. }) = e.downcast_ref::<RunnerError>() {
            eprintln!("[{}]", conflict);
            std::process::exit(EXIT_CONFLICT);
        }
        return Err(e);
    }

    let summary = orchestrator.summary(run_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }

    if !summary.is_success() {
        std::process::exit(EXIT_FAILED);
    }
    Ok(())
}

/// Validate the warehouse's current raw table and require it to be non-empty
async fn test_raw_table() -> Result<()> {
    let cfg = config::config()?;
    let warehouse = Warehouse::new(cfg.warehouse.clone());

    let batch = warehouse
        .raw_batch()
        .await
        .context("Failed to read the raw table; has 'healthpipe transform' run?")?;
    let results = validate(&batch, &cfg.quality);
    let blocking = blocking_failures(&results);
    let warnings = results.iter().filter(|r| !r.passed && !r.is_blocking_failure()).count();

    println!("Rows: {}", batch.len());
    println!("Blocking failures: {}", blocking.len());
    println!("Warnings: {}", warnings);
    for failure in blocking.iter().take(10) {
        println!("  {}: {}", failure.check, failure.detail);
    }

    if batch.is_empty() || !blocking.is_empty() {
        eprintln!("\n[Raw table check failed]");
        std::process::exit(EXIT_FAILED);
    }
    eprintln!("\n[Raw table check passed]");
    Ok(())
}

/// Show executions for a run, oldest first
async fn show_logs(run_id: Option<String>, json: bool) -> Result<()> {
    let ledger = RunLedger::open_default()?;

    let run_id = resolve_run_id(&ledger, run_id).await?;
    let log = ledger.executions(run_id).await?;

    if json {
        for execution in log.iter() {
            println!("{}", serde_json::to_string(execution)?);
        }
        return Ok(());
    }

    if log.is_empty() {
        println!("No executions recorded for run {}", run_id);
        return Ok(());
    }

    println!("Run: {}\n", run_id);
    println!(
        "{:<12} {:>7} {:<12} {:>8} {:<20} DETAIL",
        "STAGE", "ATTEMPT", "OUTCOME", "RECORDS", "STARTED"
    );
    println!("{}", "-".repeat(90));

    for execution in log.iter() {
        let detail = execution
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| execution.summary.clone());
        println!(
            "{:<12} {:>7} {:<12} {:>8} {:<20} {}",
            execution.stage.as_str(),
            execution.attempt,
            execution.outcome.as_str(),
            execution.records,
            execution.started_at.format("%Y-%m-%d %H:%M:%S"),
            detail
        );
        print_quality_failures(execution, "             ");
    }

    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;

    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;
    let summary = orchestrator.summary(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;
    let runs = orchestrator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<20} {:<15}", "RUN ID", "OUTCOME", "STARTED", "FIRST FAILURE");
    println!("{}", "-".repeat(90));

    for run in runs {
        let failed_at = run
            .first_failure
            .as_ref()
            .map(|f| f.stage.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<12} {:<20} {:<15}",
            run.run_id,
            run.outcome,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            failed_at
        );
    }

    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("healthpipe configuration\n");
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:         {}", cfg.home.display());
    println!("  Runs:         {}", cfg.runs_dir().display());
    println!("  Object store: {}", cfg.object_store.display());
    println!("  Warehouse:    {}", cfg.warehouse.display());
    println!("  Models:       {}", cfg.models_dir().display());
    println!();
    println!("Source:");
    println!("  URL:      {}", cfg.source.url);
    println!("  Dataset:  {}", cfg.source.dataset);
    println!(
        "  Max rows: {}",
        cfg.source
            .max_rows
            .map(|n| n.to_string())
            .unwrap_or_else(|| "(all)".to_string())
    );
    println!("  Retries:  {} attempt(s)", cfg.source.retry.max_attempts);
    println!();
    println!("Stage timeouts:");
    for stage in Stage::ALL {
        println!("  {:<10} {}s", stage.as_str(), cfg.stages.timeout(stage).as_secs());
    }
    println!(
        "  In-progress executions older than {}s read as failed",
        cfg.stages.max_stage_duration_seconds
    );
    println!();
    println!("Train:");
    match &cfg.train.command {
        Some(spec) => println!("  Command:  {}", spec.display()),
        None => println!("  Command:  (built-in baseline)"),
    }
    println!("  Min rows: {}", cfg.train.min_rows);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_commands_parse() {
        let cli = Cli::try_parse_from(["healthpipe", "dbt-run"]).unwrap();
        assert!(matches!(cli.command, Commands::DbtRun { run_id: None }));

        let cli = Cli::try_parse_from(["healthpipe", "ml", "--run-id", "abc"]).unwrap();
        assert!(matches!(cli.command, Commands::Ml { run_id: Some(ref id) } if id == "abc"));
    }

    #[test]
    fn test_pipeline_and_logs_flags() {
        let cli = Cli::try_parse_from(["healthpipe", "pipeline", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Pipeline { run_id: None, json: true }));

        let cli = Cli::try_parse_from(["healthpipe", "logs"]).unwrap();
        assert!(matches!(cli.command, Commands::Logs { run_id: None, json: false }));
    }

    #[test]
    fn test_invalid_run_id_rejected() {
        assert!(parse_run_id("not-a-uuid").is_err());
        let id = RunId::generate();
        assert_eq!(parse_run_id(&id.to_string()).unwrap(), id);
    }
}

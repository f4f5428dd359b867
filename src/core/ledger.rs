//! Append-only run ledger with file-based persistence.
//!
//! Each run gets its own directory holding a `ledger.jsonl` file of
//! newline-delimited JSON records: stage executions and run snapshots.
//! Rows are never edited or deleted; the current state of a stage is the
//! latest record for it.
//!
//! Writers hold an exclusive advisory lock on the run's ledger file for the
//! duration of a check-and-append, so concurrent appends (from tasks or
//! processes) are never lost and (run, stage, attempt) stays unique.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{FailureDetail, Run, RunId, Stage, StageExecution};

use super::error::LedgerError;

/// A single line in a run's ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    Execution(StageExecution),
    Run(Run),
}

/// Result of trying to claim a stage for execution
#[derive(Debug, Clone)]
pub enum Claim {
    /// The claim was appended; the caller owns this in-progress attempt
    Acquired(StageExecution),

    /// Another attempt is still in progress
    Conflict(StageExecution),
}

/// File-based, append-only ledger of stage executions and runs
#[derive(Debug, Clone)]
pub struct RunLedger {
    /// Directory holding one subdirectory per run
    root: PathBuf,

    /// In-progress executions older than this read as failed
    max_stage_duration: Duration,
}

impl RunLedger {
    /// Open (or create) a ledger rooted at `root`
    pub fn open(root: impl Into<PathBuf>, max_stage_duration: Duration) -> Result<Self, LedgerError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self {
            root,
            max_stage_duration,
        })
    }

    /// Open the ledger at the configured location ($HEALTHPIPE_HOME/runs)
    pub fn open_default() -> anyhow::Result<Self> {
        let cfg = crate::config::config()?;
        Ok(Self::open(cfg.runs_dir(), cfg.stages.max_stage_duration())?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_stage_duration(&self) -> Duration {
        self.max_stage_duration
    }

    /// Path of the ledger file for a run
    pub fn ledger_path(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string()).join("ledger.jsonl")
    }

    /// Durably append a stage execution.
    ///
    /// Rejects a second claim or a second terminal record for the same
    /// (run, stage, attempt).
    pub async fn append(&self, execution: &StageExecution) -> Result<(), LedgerError> {
        let ledger = self.clone();
        let execution = execution.clone();
        blocking(move || {
            ledger.with_exclusive(execution.run_id, |file, path, records| {
                let clash = records.iter().any(|r| match r {
                    LedgerRecord::Execution(e) => {
                        e.stage == execution.stage
                            && e.attempt == execution.attempt
                            && e.outcome.is_terminal() == execution.outcome.is_terminal()
                    }
                    LedgerRecord::Run(_) => false,
                });
                if clash {
                    return Err(LedgerError::Duplicate {
                        run_id: execution.run_id,
                        stage: execution.stage,
                        attempt: execution.attempt,
                    });
                }
                write_record(file, path, &LedgerRecord::Execution(execution.clone()))
            })
        })
        .await
    }

    /// Atomically claim the next attempt of a stage.
    ///
    /// If the latest execution for (run, stage) is still in progress (and not
    /// stale), nothing is written and the running execution is returned.
    pub async fn claim(&self, run_id: RunId, stage: Stage) -> Result<Claim, LedgerError> {
        let ledger = self.clone();
        blocking(move || {
            ledger.with_exclusive(run_id, |file, path, records| {
                let latest = latest_of(records, stage)
                    .map(|e| e.reconcile(ledger.max_stage_duration, Utc::now()));

                if let Some(current) = latest {
                    if current.is_in_progress() {
                        return Ok(Claim::Conflict(current));
                    }
                }

                let claim = StageExecution::started(run_id, stage, next_attempt(records, stage));
                write_record(file, path, &LedgerRecord::Execution(claim.clone()))?;
                Ok(Claim::Acquired(claim))
            })
        })
        .await
    }

    /// Atomically append a skipped execution with the next attempt number.
    ///
    /// Like [`claim`](Self::claim), a stage that is still in progress is
    /// reported as a conflict instead of being shadowed by the skip.
    pub async fn append_skipped(
        &self,
        run_id: RunId,
        stage: Stage,
        failure: FailureDetail,
    ) -> Result<Claim, LedgerError> {
        let ledger = self.clone();
        blocking(move || {
            ledger.with_exclusive(run_id, |file, path, records| {
                let latest = latest_of(records, stage)
                    .map(|e| e.reconcile(ledger.max_stage_duration, Utc::now()));

                if let Some(current) = latest {
                    if current.is_in_progress() {
                        return Ok(Claim::Conflict(current));
                    }
                }

                let skipped =
                    StageExecution::skipped(run_id, stage, next_attempt(records, stage), failure);
                write_record(file, path, &LedgerRecord::Execution(skipped.clone()))?;
                Ok(Claim::Acquired(skipped))
            })
        })
        .await
    }

    /// Most recent execution for (run, stage), with stale claims reconciled
    pub async fn latest(&self, run_id: RunId, stage: Stage) -> Result<Option<StageExecution>, LedgerError> {
        let records = self.read(run_id).await?;
        Ok(latest_of(&records, stage).map(|e| e.reconcile(self.max_stage_duration, Utc::now())))
    }

    /// All executions of a run in chronological order.
    ///
    /// The log is read in one pass under a shared lock and returned as a
    /// snapshot: a terminal record sits after its claim in the file, so
    /// collapsing the two needs the whole run's records. Appends made after
    /// this call are not visible through the returned log; call again to see
    /// them.
    pub async fn executions(&self, run_id: RunId) -> Result<ExecutionLog, LedgerError> {
        let records = self.read(run_id).await?;
        let now = Utc::now();

        // A terminal record replaces the claim of the same attempt in place
        let mut order: Vec<Uuid> = Vec::new();
        let mut by_id: HashMap<Uuid, StageExecution> = HashMap::new();
        for record in records {
            if let LedgerRecord::Execution(e) = record {
                if !by_id.contains_key(&e.id) {
                    order.push(e.id);
                }
                by_id.insert(e.id, e);
            }
        }

        let executions = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .map(|e| e.reconcile(self.max_stage_duration, now))
            .collect();

        Ok(ExecutionLog { run_id, executions })
    }

    /// Append a run snapshot. A run that already has a terminal record is never changed.
    pub async fn record_run(&self, run: &Run) -> Result<(), LedgerError> {
        let ledger = self.clone();
        let run = run.clone();
        blocking(move || {
            ledger.with_exclusive(run.id, |file, path, records| {
                let finished = records.iter().any(|r| {
                    matches!(r, LedgerRecord::Run(existing) if existing.is_finished())
                });
                if finished {
                    return Err(LedgerError::RunFinished(run.id));
                }
                write_record(file, path, &LedgerRecord::Run(run.clone()))
            })
        })
        .await
    }

    /// Latest snapshot of a run
    pub async fn run(&self, run_id: RunId) -> Result<Option<Run>, LedgerError> {
        let records = self.read(run_id).await?;
        Ok(records.into_iter().rev().find_map(|r| match r {
            LedgerRecord::Run(run) => Some(run),
            LedgerRecord::Execution(_) => None,
        }))
    }

    /// All run ids with a ledger, oldest first
    pub async fn runs(&self) -> Result<Vec<RunId>, LedgerError> {
        let root = self.root.clone();
        blocking(move || {
            let mut runs = Vec::new();
            if !root.exists() {
                return Ok(runs);
            }

            for entry in fs::read_dir(&root).map_err(io_err(&root))? {
                let entry = entry.map_err(io_err(&root))?;
                if !entry.path().is_dir() {
                    continue;
                }
                if let Some(run_id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                    runs.push(run_id);
                }
            }

            // v7 ids sort by creation time
            runs.sort();
            Ok(runs)
        })
        .await
    }

    /// The most recently created run, if any
    pub async fn latest_run(&self) -> Result<Option<RunId>, LedgerError> {
        Ok(self.runs().await?.pop())
    }

    async fn read(&self, run_id: RunId) -> Result<Vec<LedgerRecord>, LedgerError> {
        let path = self.ledger_path(run_id);
        blocking(move || {
            if !path.exists() {
                return Ok(Vec::new());
            }
            let mut file = File::open(&path).map_err(io_err(&path))?;
            FileExt::lock_shared(&file).map_err(io_err(&path))?;
            let result = read_records(&mut file, &path);
            let _ = FileExt::unlock(&file);
            result
        })
        .await
    }

    /// Run `f` with the run's ledger file exclusively locked and its records loaded
    fn with_exclusive<T>(
        &self,
        run_id: RunId,
        f: impl FnOnce(&mut File, &Path, &[LedgerRecord]) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let path = self.ledger_path(run_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;

        FileExt::lock_exclusive(&file).map_err(io_err(&path))?;
        let result = read_records(&mut file, &path).and_then(|records| f(&mut file, &path, &records));
        let _ = FileExt::unlock(&file);
        result
    }
}

/// A finite, restartable snapshot of a run's executions in chronological order.
///
/// Iterating never touches the ledger file, so every pass over the same log
/// yields the same executions.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    run_id: RunId,
    executions: Vec<StageExecution>,
}

impl ExecutionLog {
    /// Wrap executions already in chronological order
    pub fn from_executions(run_id: RunId, executions: Vec<StageExecution>) -> Self {
        Self { run_id, executions }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Iterate from the beginning; may be called any number of times
    pub fn iter(&self) -> std::slice::Iter<'_, StageExecution> {
        self.executions.iter()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// Executions of one stage, oldest first
    pub fn for_stage(&self, stage: Stage) -> impl Iterator<Item = &StageExecution> {
        self.executions.iter().filter(move |e| e.stage == stage)
    }

    pub fn into_vec(self) -> Vec<StageExecution> {
        self.executions
    }
}

impl<'a> IntoIterator for &'a ExecutionLog {
    type Item = &'a StageExecution;
    type IntoIter = std::slice::Iter<'a, StageExecution>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn latest_of(records: &[LedgerRecord], stage: Stage) -> Option<StageExecution> {
    records.iter().rev().find_map(|r| match r {
        LedgerRecord::Execution(e) if e.stage == stage => Some(e.clone()),
        _ => None,
    })
}

fn next_attempt(records: &[LedgerRecord], stage: Stage) -> u32 {
    records
        .iter()
        .filter_map(|r| match r {
            LedgerRecord::Execution(e) if e.stage == stage => Some(e.attempt),
            _ => None,
        })
        .max()
        .unwrap_or(0)
        + 1
}

fn read_records(file: &mut File, path: &Path) -> Result<Vec<LedgerRecord>, LedgerError> {
    let mut content = String::new();
    file.read_to_string(&mut content).map_err(io_err(path))?;

    let mut records = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}

fn write_record(file: &mut File, path: &Path, record: &LedgerRecord) -> Result<(), LedgerError> {
    let json = serde_json::to_string(record)?;
    file.write_all(format!("{}\n", json).as_bytes())
        .map_err(io_err(path))?;
    file.flush().map_err(io_err(path))?;
    file.sync_data().map_err(io_err(path))?;
    Ok(())
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn blocking<T, F>(f: F) -> Result<T, LedgerError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LedgerError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionOutcome, FailureKind};
    use tempfile::TempDir;

    fn create_test_ledger() -> (RunLedger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let ledger = RunLedger::open(temp_dir.path().join("runs"), Duration::from_secs(600)).unwrap();
        (ledger, temp_dir)
    }

    #[tokio::test]
    async fn test_claim_and_complete() {
        let (ledger, _temp) = create_test_ledger();
        let run_id = RunId::generate();

        let Claim::Acquired(claim) = ledger.claim(run_id, Stage::Ingest).await.unwrap() else {
            panic!("expected claim");
        };
        assert_eq!(claim.attempt, 1);

        let latest = ledger.latest(run_id, Stage::Ingest).await.unwrap().unwrap();
        assert!(latest.is_in_progress());

        let done = claim.succeed(5, None, "ok".to_string());
        ledger.append(&done).await.unwrap();

        let latest = ledger.latest(run_id, Stage::Ingest).await.unwrap().unwrap();
        assert_eq!(latest.outcome, ExecutionOutcome::Succeeded);

        // Claim and completion collapse into one logical execution
        let log = ledger.executions(run_id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.iter().next().unwrap().records, 5);
    }

    #[tokio::test]
    async fn test_second_claim_conflicts() {
        let (ledger, _temp) = create_test_ledger();
        let run_id = RunId::generate();

        assert!(matches!(
            ledger.claim(run_id, Stage::Transform).await.unwrap(),
            Claim::Acquired(_)
        ));
        assert!(matches!(
            ledger.claim(run_id, Stage::Transform).await.unwrap(),
            Claim::Conflict(_)
        ));

        // Other stages and other runs are unaffected
        assert!(matches!(
            ledger.claim(run_id, Stage::Ingest).await.unwrap(),
            Claim::Acquired(_)
        ));
        assert!(matches!(
            ledger.claim(RunId::generate(), Stage::Transform).await.unwrap(),
            Claim::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_stale_claim_is_reconciled() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = RunLedger::open(temp_dir.path(), Duration::from_secs(60)).unwrap();
        let run_id = RunId::generate();

        let mut stale = StageExecution::started(run_id, Stage::Train, 1);
        stale.started_at = Utc::now() - chrono::Duration::seconds(3600);
        ledger.append(&stale).await.unwrap();

        let latest = ledger.latest(run_id, Stage::Train).await.unwrap().unwrap();
        assert_eq!(latest.outcome, ExecutionOutcome::Failed);
        assert_eq!(latest.failure.unwrap().kind, FailureKind::ReconciledTimeout);

        // A stale claim does not block a new attempt
        let Claim::Acquired(retry) = ledger.claim(run_id, Stage::Train).await.unwrap() else {
            panic!("stale claim should not conflict");
        };
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn test_duplicate_attempt_rejected() {
        let (ledger, _temp) = create_test_ledger();
        let run_id = RunId::generate();

        let claim = StageExecution::started(run_id, Stage::Ingest, 1);
        ledger.append(&claim).await.unwrap();
        let done = claim.succeed(1, None, "ok".to_string());
        ledger.append(&done).await.unwrap();

        let err = ledger.append(&done).await.unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn test_executions_are_restartable() {
        let (ledger, _temp) = create_test_ledger();
        let run_id = RunId::generate();

        for stage in [Stage::Ingest, Stage::Transform] {
            let claim = ledger
                .append_skipped(
                    run_id,
                    stage,
                    FailureDetail::new(FailureKind::Cancelled, "run cancelled"),
                )
                .await
                .unwrap();
            let Claim::Acquired(skipped) = claim else {
                panic!("nothing was in progress");
            };
            assert_eq!(skipped.attempt, 1);
            assert_eq!(skipped.outcome, ExecutionOutcome::Skipped);
        }

        let log = ledger.executions(run_id).await.unwrap();
        let first: Vec<Stage> = log.iter().map(|e| e.stage).collect();
        let second: Vec<Stage> = log.iter().map(|e| e.stage).collect();
        assert_eq!(first, vec![Stage::Ingest, Stage::Transform]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_executions_snapshot_ignores_later_appends() {
        let (ledger, _temp) = create_test_ledger();
        let run_id = RunId::generate();

        let Claim::Acquired(claim) = ledger.claim(run_id, Stage::Ingest).await.unwrap() else {
            panic!("expected claim");
        };
        let before = ledger.executions(run_id).await.unwrap();

        ledger.append(&claim.succeed(2, None, "ok".to_string())).await.unwrap();
        ledger.claim(run_id, Stage::Transform).await.unwrap();

        // The earlier log still shows the world as it was read
        assert_eq!(before.len(), 1);
        assert!(before.iter().all(|e| e.is_in_progress()));

        let after = ledger.executions(run_id).await.unwrap();
        let outcomes: Vec<ExecutionOutcome> = after.iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec![ExecutionOutcome::Succeeded, ExecutionOutcome::InProgress]);
    }

    #[tokio::test]
    async fn test_terminal_run_record_is_final() {
        let (ledger, _temp) = create_test_ledger();
        let run_id = RunId::generate();
        let mut run = Run::new(run_id);

        ledger.record_run(&run).await.unwrap();
        run.finish(&[]);
        ledger.record_run(&run).await.unwrap();

        let err = ledger.record_run(&run).await.unwrap_err();
        assert!(matches!(err, LedgerError::RunFinished(id) if id == run_id));

        let stored = ledger.run(run_id).await.unwrap().unwrap();
        assert!(stored.is_finished());
    }

    #[tokio::test]
    async fn test_unknown_run_is_empty() {
        let (ledger, _temp) = create_test_ledger();
        let run_id = RunId::generate();

        assert!(ledger.latest(run_id, Stage::Ingest).await.unwrap().is_none());
        assert!(ledger.executions(run_id).await.unwrap().is_empty());
        assert!(ledger.run(run_id).await.unwrap().is_none());
        assert!(ledger.runs().await.unwrap().is_empty());
        assert!(ledger.latest_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runs_listed_oldest_first() {
        let (ledger, _temp) = create_test_ledger();
        let first = RunId::generate();
        let second = RunId::generate();

        ledger.record_run(&Run::new(second)).await.unwrap();
        ledger.record_run(&Run::new(first)).await.unwrap();

        assert_eq!(ledger.runs().await.unwrap(), vec![first, second]);
        assert_eq!(ledger.latest_run().await.unwrap(), Some(second));
    }
}

//! RedbLedger: redb-backed persistence for runs, actions, and releases.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! ledger supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use deploy_core::{
    ActionExecution, ActionOutcome, ErrorKind, ErrorRecord, ExecutionStatus, PhaseResult,
    PipelineRun, PipelineState, ProgressPoint, Release, RepositoryMetadata, RollbackReport,
    RunOutcome, epoch_millis, summarize,
};

use crate::error::{LedgerError, LedgerResult};
use crate::tables::*;

/// Convert any `Display` error into a `LedgerError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| LedgerError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Operations the controller, runner, and query surface rely on.
///
/// Writes are synchronous: when a method returns `Ok`, the change is
/// durable and visible to every subsequent read.
pub trait Ledger: Send + Sync {
    // ── Pipeline runs ──

    /// Persist a newly admitted run. Fails if the id is taken.
    fn create_run(&self, run: &PipelineRun) -> LedgerResult<()>;

    /// Move a run to a non-terminal state.
    fn set_run_state(&self, id: &str, state: PipelineState) -> LedgerResult<PipelineRun>;

    /// Attach repository metadata gathered as run context.
    fn set_run_context(&self, id: &str, metadata: RepositoryMetadata) -> LedgerResult<()>;

    /// Append the next phase result. Its sequence must be exactly one past
    /// the last committed result.
    fn append_result(&self, id: &str, result: PhaseResult) -> LedgerResult<PipelineRun>;

    /// Record the terminal outcome. The run is immutable afterwards.
    fn complete_run(
        &self,
        id: &str,
        outcome: RunOutcome,
        url: Option<String>,
    ) -> LedgerResult<PipelineRun>;

    fn get_run(&self, id: &str) -> LedgerResult<Option<PipelineRun>>;

    /// Runs for a deployment, oldest first.
    fn list_runs_for_deployment(&self, deployment_id: &str) -> LedgerResult<Vec<PipelineRun>>;

    // ── Action executions ──

    fn create_action(&self, action: &ActionExecution) -> LedgerResult<()>;

    /// `queued → in_progress`.
    fn start_action(&self, id: &str) -> LedgerResult<ActionExecution>;

    /// Record a progress report. A percent lower than the current one is
    /// rejected; an equal percent only updates the step label.
    fn set_progress(&self, id: &str, percent: u8, step: &str) -> LedgerResult<ActionExecution>;

    /// Record the terminal outcome. A completed action ends at 100%.
    fn complete_action(&self, id: &str, outcome: ActionOutcome) -> LedgerResult<ActionExecution>;

    fn get_action(&self, id: &str) -> LedgerResult<Option<ActionExecution>>;

    /// All actions, oldest first.
    fn list_actions(&self) -> LedgerResult<Vec<ActionExecution>>;

    // ── Releases ──

    fn record_release(&self, release: &Release) -> LedgerResult<()>;

    fn latest_release(&self, deployment_id: &str) -> LedgerResult<Option<Release>>;

    // ── Restart ──

    /// Fail every run and action left non-terminal by a previous process.
    fn recover_interrupted(&self) -> LedgerResult<RecoveryReport>;
}

/// What [`Ledger::recover_interrupted`] closed out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub runs: Vec<String>,
    pub actions: Vec<String>,
}

/// Thread-safe ledger backed by redb.
#[derive(Clone)]
pub struct RedbLedger {
    db: Arc<Database>,
}

impl RedbLedger {
    /// Open (or create) a persistent ledger at the given path.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let ledger = Self { db: Arc::new(db) };
        ledger.ensure_tables()?;
        debug!(?path, "ledger opened");
        Ok(ledger)
    }

    /// Create an ephemeral in-memory ledger (for testing).
    pub fn open_in_memory() -> LedgerResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let ledger = Self { db: Arc::new(db) };
        ledger.ensure_tables()?;
        debug!("in-memory ledger opened");
        Ok(ledger)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(PIPELINE_RUNS).map_err(map_err!(Table))?;
        txn.open_table(ACTION_EXECUTIONS).map_err(map_err!(Table))?;
        txn.open_table(RELEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn insert_new<T: Serialize>(&self, def: JsonTable, key: &str, record: &T) -> LedgerResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(LedgerError::AlreadyExists(key.to_string()));
            }
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn upsert<T: Serialize>(&self, def: JsonTable, key: &str, record: &T) -> LedgerResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read-modify-write one record inside a single write transaction.
    /// If `apply` fails the transaction is dropped and nothing changes.
    fn update<T, F>(&self, def: JsonTable, key: &str, apply: F) -> LedgerResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> LedgerResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let mut record: T = {
                let guard = table
                    .get(key)
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| LedgerError::NotFound(key.to_string()))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };
            apply(&mut record)?;
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    fn fetch<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> LedgerResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, def: JsonTable) -> LedgerResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }
}

fn ensure_run_open(run: &PipelineRun) -> LedgerResult<()> {
    if run.is_terminal() {
        return Err(LedgerError::Terminal(run.id.clone()));
    }
    Ok(())
}

fn ensure_action_open(action: &ActionExecution) -> LedgerResult<()> {
    if action.is_terminal() {
        return Err(LedgerError::Terminal(action.id.clone()));
    }
    Ok(())
}

impl Ledger for RedbLedger {
    fn create_run(&self, run: &PipelineRun) -> LedgerResult<()> {
        self.insert_new(PIPELINE_RUNS, &run.id, run)?;
        debug!(run = %run.id, deployment = %run.deployment.id, "run created");
        Ok(())
    }

    fn set_run_state(&self, id: &str, state: PipelineState) -> LedgerResult<PipelineRun> {
        self.update(PIPELINE_RUNS, id, |run: &mut PipelineRun| {
            ensure_run_open(run)?;
            if state.is_terminal() {
                return Err(LedgerError::Write(format!(
                    "terminal state {state:?} must be set through complete_run"
                )));
            }
            run.state = state;
            run.status = state.status();
            if run.status == ExecutionStatus::InProgress && run.started_at.is_none() {
                run.started_at = Some(epoch_millis());
            }
            Ok(())
        })
    }

    fn set_run_context(&self, id: &str, metadata: RepositoryMetadata) -> LedgerResult<()> {
        self.update(PIPELINE_RUNS, id, |run: &mut PipelineRun| {
            ensure_run_open(run)?;
            run.repository = Some(metadata);
            Ok(())
        })
        .map(|_| ())
    }

    fn append_result(&self, id: &str, result: PhaseResult) -> LedgerResult<PipelineRun> {
        let phase = result.phase;
        let run = self.update(PIPELINE_RUNS, id, |run: &mut PipelineRun| {
            ensure_run_open(run)?;
            let expected = run.next_sequence();
            if result.sequence != expected {
                return Err(LedgerError::OutOfOrder {
                    expected,
                    got: result.sequence,
                });
            }
            run.results.push(result);
            Ok(())
        })?;
        debug!(run = %id, ?phase, sequence = run.results.len(), "phase result committed");
        Ok(run)
    }

    fn complete_run(
        &self,
        id: &str,
        outcome: RunOutcome,
        url: Option<String>,
    ) -> LedgerResult<PipelineRun> {
        let run = self.update(PIPELINE_RUNS, id, |run: &mut PipelineRun| {
            ensure_run_open(run)?;
            if !outcome.state.is_terminal() {
                return Err(LedgerError::Write(format!(
                    "{:?} is not a terminal state",
                    outcome.state
                )));
            }
            let now = epoch_millis();
            run.state = outcome.state;
            run.status = outcome.state.status();
            run.rolled_back = outcome.rollback.attempted;
            run.started_at.get_or_insert(now);
            run.finished_at = Some(now);
            if url.is_some() {
                run.url = url;
            }
            run.outcome = Some(outcome);
            Ok(())
        })?;
        debug!(run = %id, state = ?run.state, "run completed");
        Ok(run)
    }

    fn get_run(&self, id: &str) -> LedgerResult<Option<PipelineRun>> {
        self.fetch(PIPELINE_RUNS, id)
    }

    fn list_runs_for_deployment(&self, deployment_id: &str) -> LedgerResult<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self
            .scan::<PipelineRun>(PIPELINE_RUNS)?
            .into_iter()
            .filter(|run| run.deployment.id == deployment_id)
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    fn create_action(&self, action: &ActionExecution) -> LedgerResult<()> {
        self.insert_new(ACTION_EXECUTIONS, &action.id, action)?;
        debug!(action = %action.id, kind = %action.kind, "action created");
        Ok(())
    }

    fn start_action(&self, id: &str) -> LedgerResult<ActionExecution> {
        self.update(ACTION_EXECUTIONS, id, |action: &mut ActionExecution| {
            ensure_action_open(action)?;
            action.status = ExecutionStatus::InProgress;
            action.started_at.get_or_insert_with(epoch_millis);
            Ok(())
        })
    }

    fn set_progress(&self, id: &str, percent: u8, step: &str) -> LedgerResult<ActionExecution> {
        if percent > 100 {
            return Err(LedgerError::InvalidProgress(percent));
        }
        self.update(ACTION_EXECUTIONS, id, |action: &mut ActionExecution| {
            ensure_action_open(action)?;
            if percent < action.progress {
                return Err(LedgerError::ProgressRegression {
                    current: action.progress,
                    requested: percent,
                });
            }
            action.progress = percent;
            action.step = step.to_string();
            action.history.push(ProgressPoint {
                percent,
                step: step.to_string(),
                at: epoch_millis(),
            });
            Ok(())
        })
    }

    fn complete_action(&self, id: &str, outcome: ActionOutcome) -> LedgerResult<ActionExecution> {
        let action = self.update(ACTION_EXECUTIONS, id, |action: &mut ActionExecution| {
            ensure_action_open(action)?;
            let now = epoch_millis();
            action.started_at.get_or_insert(now);
            action.finished_at = Some(now);
            match outcome {
                ActionOutcome::Completed(result) => {
                    action.status = ExecutionStatus::Completed;
                    if action.progress < 100 {
                        action.history.push(ProgressPoint {
                            percent: 100,
                            step: "completed".to_string(),
                            at: now,
                        });
                    }
                    action.progress = 100;
                    action.step = "completed".to_string();
                    action.result = Some(result);
                }
                ActionOutcome::Failed(error) => {
                    action.status = ExecutionStatus::Failed;
                    action.error = Some(error);
                }
            }
            Ok(())
        })?;
        debug!(action = %id, status = ?action.status, "action completed");
        Ok(action)
    }

    fn get_action(&self, id: &str) -> LedgerResult<Option<ActionExecution>> {
        self.fetch(ACTION_EXECUTIONS, id)
    }

    fn list_actions(&self) -> LedgerResult<Vec<ActionExecution>> {
        let mut actions: Vec<ActionExecution> = self.scan(ACTION_EXECUTIONS)?;
        actions.sort_by_key(|action| action.created_at);
        Ok(actions)
    }

    fn record_release(&self, release: &Release) -> LedgerResult<()> {
        self.upsert(RELEASES, &release.deployment_id, release)?;
        debug!(
            deployment = %release.deployment_id,
            image = %release.image_reference,
            "release recorded"
        );
        Ok(())
    }

    fn latest_release(&self, deployment_id: &str) -> LedgerResult<Option<Release>> {
        self.fetch(RELEASES, deployment_id)
    }

    fn recover_interrupted(&self) -> LedgerResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let open_runs: Vec<PipelineRun> = self
            .scan::<PipelineRun>(PIPELINE_RUNS)?
            .into_iter()
            .filter(|run| !run.is_terminal())
            .collect();
        for run in open_runs {
            let error = ErrorRecord::new(
                ErrorKind::Interrupted,
                None,
                format!("run was {:?} when deployd restarted", run.state),
            );
            let rollback = RollbackReport::default();
            let summary = summarize(
                &run.deployment.id,
                PipelineState::Failed,
                Some(&error),
                &rollback,
                None,
            );
            let outcome = RunOutcome {
                state: PipelineState::Failed,
                error: Some(error),
                rollback,
                summary,
            };
            self.complete_run(&run.id, outcome, None)?;
            warn!(run = %run.id, deployment = %run.deployment.id, "interrupted run marked failed");
            report.runs.push(run.id);
        }

        let open_actions: Vec<ActionExecution> = self
            .scan::<ActionExecution>(ACTION_EXECUTIONS)?
            .into_iter()
            .filter(|action| !action.is_terminal())
            .collect();
        for action in open_actions {
            let outcome = ActionOutcome::failed(
                ErrorKind::Interrupted,
                format!("action was at {}% ({}) when deployd restarted", action.progress, action.step),
            );
            self.complete_action(&action.id, outcome)?;
            warn!(action = %action.id, kind = %action.kind, "interrupted action marked failed");
            report.actions.push(action.id);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use deploy_core::*;

    fn test_deployment(id: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            repository: RepositoryRef {
                url: "https://git.example.com/shop/api".to_string(),
                reference: "main".to_string(),
            },
            instance: "i-0abc".to_string(),
            strategy: RolloutStrategy::default(),
            environment: "staging".to_string(),
            port: 8080,
            health: HealthCheckSpec {
                path: "/healthz".to_string(),
                timeout: "30s".to_string(),
                interval: "1s".to_string(),
                healthy_threshold: 1,
            },
        }
    }

    fn scan_result(sequence: u32) -> PhaseResult {
        PhaseResult {
            sequence,
            phase: PhaseKind::SecurityScan,
            started_at: 1,
            ended_at: 2,
            attempts: 1,
            success: true,
            payload: Some(PhasePayload::Scan(ScanReport {
                passed: true,
                findings: BTreeMap::new(),
            })),
            error: None,
        }
    }

    fn test_action(id: &str) -> ActionExecution {
        ActionExecution::new(
            id.to_string(),
            ActionRequest {
                kind: ActionKind::RestartInstance,
                targets: vec![ActionTarget {
                    deployment_id: "shop-api".to_string(),
                    instance: "i-0abc".to_string(),
                }],
                parameters: BTreeMap::new(),
                confirmed: true,
            },
        )
    }

    fn completed_outcome() -> RunOutcome {
        RunOutcome {
            state: PipelineState::Completed,
            error: None,
            rollback: RollbackReport::default(),
            summary: "shop-api: released".to_string(),
        }
    }

    // ── Pipeline runs ──────────────────────────────────────────────

    #[test]
    fn run_create_and_get() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let run = PipelineRun::new("run-1".to_string(), test_deployment("shop-api"), None);

        ledger.create_run(&run).unwrap();
        let stored = ledger.get_run("run-1").unwrap().unwrap();
        assert_eq!(stored, run);
        assert_eq!(stored.status, ExecutionStatus::Queued);
    }

    #[test]
    fn run_create_twice_is_rejected() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let run = PipelineRun::new("run-1".to_string(), test_deployment("shop-api"), None);
        ledger.create_run(&run).unwrap();
        assert!(matches!(
            ledger.create_run(&run),
            Err(LedgerError::AlreadyExists(_))
        ));
    }

    #[test]
    fn state_transition_sets_status_and_start_time() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let run = PipelineRun::new("run-1".to_string(), test_deployment("shop-api"), None);
        ledger.create_run(&run).unwrap();

        let run = ledger
            .set_run_state("run-1", PipelineState::ScanningSecurity)
            .unwrap();
        assert_eq!(run.status, ExecutionStatus::InProgress);
        assert!(run.started_at.is_some());

        assert!(ledger.set_run_state("run-1", PipelineState::Completed).is_err());
    }

    #[test]
    fn append_enforces_sequence() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let run = PipelineRun::new("run-1".to_string(), test_deployment("shop-api"), None);
        ledger.create_run(&run).unwrap();

        match ledger.append_result("run-1", scan_result(2)) {
            Err(LedgerError::OutOfOrder { expected, got }) => {
                assert_eq!(expected, 1);
                assert_eq!(got, 2);
            }
            other => panic!("expected OutOfOrder, got {other:?}"),
        }

        let run = ledger.append_result("run-1", scan_result(1)).unwrap();
        assert_eq!(run.results.len(), 1);
        assert!(ledger.append_result("run-1", scan_result(1)).is_err());
    }

    #[test]
    fn completed_run_is_immutable() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let run = PipelineRun::new("run-1".to_string(), test_deployment("shop-api"), None);
        ledger.create_run(&run).unwrap();
        let run = ledger
            .complete_run("run-1", completed_outcome(), Some("https://shop".to_string()))
            .unwrap();
        assert_eq!(run.status, ExecutionStatus::Completed);
        assert_eq!(run.url.as_deref(), Some("https://shop"));
        assert!(run.duration_ms().is_some());

        assert!(matches!(
            ledger.append_result("run-1", scan_result(1)),
            Err(LedgerError::Terminal(_))
        ));
        assert!(ledger.complete_run("run-1", completed_outcome(), None).is_err());
    }

    #[test]
    fn rolled_back_outcome_sets_marker() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let run = PipelineRun::new("run-1".to_string(), test_deployment("shop-api"), None);
        ledger.create_run(&run).unwrap();
        let outcome = RunOutcome {
            state: PipelineState::RolledBack,
            error: None,
            rollback: RollbackReport {
                attempted: true,
                succeeded: true,
                error: None,
            },
            summary: String::new(),
        };
        let run = ledger.complete_run("run-1", outcome, None).unwrap();
        assert!(run.rolled_back);
        assert_eq!(run.status, ExecutionStatus::Failed);
    }

    #[test]
    fn list_runs_filters_by_deployment() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        for (id, dep) in [("run-1", "a"), ("run-2", "b"), ("run-3", "a")] {
            let run = PipelineRun::new(id.to_string(), test_deployment(dep), None);
            ledger.create_run(&run).unwrap();
        }
        assert_eq!(ledger.list_runs_for_deployment("a").unwrap().len(), 2);
        assert_eq!(ledger.list_runs_for_deployment("b").unwrap().len(), 1);
        assert!(ledger.list_runs_for_deployment("c").unwrap().is_empty());
    }

    #[test]
    fn missing_run_is_not_found() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        assert!(ledger.get_run("nope").unwrap().is_none());
        assert!(matches!(
            ledger.set_run_state("nope", PipelineState::Building),
            Err(LedgerError::NotFound(_))
        ));
    }

    // ── Actions ────────────────────────────────────────────────────

    #[test]
    fn progress_never_decreases() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        ledger.create_action(&test_action("act-1")).unwrap();
        ledger.start_action("act-1").unwrap();

        ledger.set_progress("act-1", 20, "stopping").unwrap();
        ledger.set_progress("act-1", 70, "waiting").unwrap();
        match ledger.set_progress("act-1", 50, "late report") {
            Err(LedgerError::ProgressRegression { current, requested }) => {
                assert_eq!(current, 70);
                assert_eq!(requested, 50);
            }
            other => panic!("expected ProgressRegression, got {other:?}"),
        }
        // Same percent again is an idempotent redelivery.
        let action = ledger.set_progress("act-1", 70, "waiting").unwrap();
        assert_eq!(action.progress, 70);
        assert!(matches!(
            ledger.set_progress("act-1", 101, "overflow"),
            Err(LedgerError::InvalidProgress(101))
        ));

        let percents: Vec<u8> = action.history.iter().map(|p| p.percent).collect();
        assert_eq!(percents, vec![20, 70, 70]);
    }

    #[test]
    fn completed_action_ends_at_100() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        ledger.create_action(&test_action("act-1")).unwrap();
        ledger.start_action("act-1").unwrap();
        ledger.set_progress("act-1", 40, "stopping").unwrap();

        let action = ledger
            .complete_action("act-1", ActionOutcome::Completed(serde_json::json!({"ok": true})))
            .unwrap();
        assert_eq!(action.status, ExecutionStatus::Completed);
        assert_eq!(action.progress, 100);
        assert_eq!(action.history.last().unwrap().percent, 100);

        assert!(matches!(
            ledger.set_progress("act-1", 100, "again"),
            Err(LedgerError::Terminal(_))
        ));
    }

    #[test]
    fn failed_action_keeps_progress() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        ledger.create_action(&test_action("act-1")).unwrap();
        ledger.start_action("act-1").unwrap();
        ledger.set_progress("act-1", 20, "stopping").unwrap();

        let action = ledger
            .complete_action(
                "act-1",
                ActionOutcome::failed(ErrorKind::ExternalFailure, "stop refused"),
            )
            .unwrap();
        assert_eq!(action.status, ExecutionStatus::Failed);
        assert_eq!(action.progress, 20);
        assert_eq!(action.error.unwrap().kind, ErrorKind::ExternalFailure);
    }

    // ── Releases ───────────────────────────────────────────────────

    #[test]
    fn release_upsert_keeps_latest() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        assert!(ledger.latest_release("shop-api").unwrap().is_none());

        for (run, image) in [("run-1", "shop-api:v1"), ("run-2", "shop-api:v2")] {
            ledger
                .record_release(&Release {
                    deployment_id: "shop-api".to_string(),
                    image_reference: image.to_string(),
                    container_reference: format!("ctr-{run}"),
                    url: "https://shop".to_string(),
                    run_id: run.to_string(),
                    recorded_at: 1000,
                })
                .unwrap();
        }
        let latest = ledger.latest_release("shop-api").unwrap().unwrap();
        assert_eq!(latest.image_reference, "shop-api:v2");
    }

    // ── Recovery ───────────────────────────────────────────────────

    #[test]
    fn recovery_fails_open_records() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let open = PipelineRun::new("run-open".to_string(), test_deployment("a"), None);
        ledger.create_run(&open).unwrap();
        ledger
            .set_run_state("run-open", PipelineState::Deploying)
            .unwrap();
        let done = PipelineRun::new("run-done".to_string(), test_deployment("b"), None);
        ledger.create_run(&done).unwrap();
        ledger
            .complete_run("run-done", completed_outcome(), None)
            .unwrap();
        ledger.create_action(&test_action("act-1")).unwrap();

        let report = ledger.recover_interrupted().unwrap();
        assert_eq!(report.runs, vec!["run-open".to_string()]);
        assert_eq!(report.actions, vec!["act-1".to_string()]);

        let run = ledger.get_run("run-open").unwrap().unwrap();
        assert_eq!(run.state, PipelineState::Failed);
        let outcome = run.outcome.unwrap();
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::Interrupted);
        assert!(outcome.summary.contains("no rollback attempted"));

        let again = ledger.recover_interrupted().unwrap();
        assert_eq!(again, RecoveryReport::default());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ledger.redb");

        {
            let ledger = RedbLedger::open(&db_path).unwrap();
            let run = PipelineRun::new("run-1".to_string(), test_deployment("shop-api"), None);
            ledger.create_run(&run).unwrap();
            ledger.append_result("run-1", scan_result(1)).unwrap();
        }

        let ledger = RedbLedger::open(&db_path).unwrap();
        let run = ledger.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.results.len(), 1);
        assert_eq!(run.results[0].phase, PhaseKind::SecurityScan);
    }

    #[test]
    fn concurrent_appends_to_distinct_runs() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let ids: Vec<String> = (0..8).map(|i| format!("run-{i}")).collect();
        for id in &ids {
            let run = PipelineRun::new(id.clone(), test_deployment(id), None);
            ledger.create_run(&run).unwrap();
        }

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for seq in 1..=4 {
                        ledger.append_result(&id, scan_result(seq)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for id in &ids {
            let run = ledger.get_run(id).unwrap().unwrap();
            let seqs: Vec<u32> = run.results.iter().map(|r| r.sequence).collect();
            assert_eq!(seqs, vec![1, 2, 3, 4]);
        }
    }
}

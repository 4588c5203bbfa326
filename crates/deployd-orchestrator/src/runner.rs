//! Action runner: executes operator-triggered remediation actions.

use std::sync::{Arc, Mutex};

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use deploy_core::{
    ActionExecution, ActionId, ActionOutcome, ActionPolicy, ActionRequest, ErrorKind, ErrorRecord,
    ExecutionStatus, epoch_millis,
};
use deployd_ledger::{Ledger, LedgerError};
use deployd_phase::actions::{self, ActionContext, ProgressSink};
use deployd_phase::gate;
use deployd_phase::{Collaborators, Outcome};

use crate::bus::{EventBus, EventKind, ExecutionEvent};
use crate::error::AdmissionError;
use crate::guard::{ConcurrencyGuard, GuardKey, Lease};

/// Handle to a spawned action.
#[derive(Debug)]
pub struct ActionHandle {
    pub action_id: ActionId,
    task: JoinHandle<ActionExecution>,
}

impl ActionHandle {
    pub async fn wait(self) -> Result<ActionExecution, JoinError> {
        self.task.await
    }
}

#[derive(Clone)]
pub struct ActionRunner {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: Arc<dyn Ledger>,
    guard: ConcurrencyGuard,
    bus: EventBus,
    collab: Collaborators,
    policy: ActionPolicy,
}

impl ActionRunner {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        guard: ConcurrencyGuard,
        bus: EventBus,
        collab: Collaborators,
        policy: ActionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                guard,
                bus,
                collab,
                policy,
            }),
        }
    }

    /// Admit an action and start it in the background.
    ///
    /// Unconfirmed destructive actions, missing parameters, and empty
    /// target lists are rejected before anything is written or called.
    pub fn submit(&self, request: ActionRequest) -> Result<ActionHandle, AdmissionError> {
        request.validate()?;
        let keys = request
            .targets
            .iter()
            .map(|t| GuardKey::Action(t.deployment_id.clone(), request.kind))
            .collect();
        let lease = self.inner.guard.try_acquire_all(keys)?;

        let action = ActionExecution::new(Uuid::new_v4().to_string(), request);
        self.inner.ledger.create_action(&action)?;
        info!(
            action = %action.id,
            kind = %action.kind,
            targets = action.targets.len(),
            "action admitted"
        );
        self.inner.publish_status(&action);

        let action_id = action.id.clone();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.execute(action, lease).await });
        Ok(ActionHandle { action_id, task })
    }
}

impl Inner {
    async fn execute(self: Arc<Self>, action: ActionExecution, lease: Lease) -> ActionExecution {
        let finished = match self.run(&action).await {
            Ok(done) => done,
            Err(err) => self.abandon(action, err),
        };

        match finished.status {
            ExecutionStatus::Completed => {
                info!(action = %finished.id, kind = %finished.kind, "action completed")
            }
            _ => warn!(
                action = %finished.id,
                kind = %finished.kind,
                error = ?finished.error.as_ref().map(|e| e.to_string()),
                "action failed"
            ),
        }
        self.publish_status(&finished);

        drop(lease);
        finished
    }

    async fn run(&self, action: &ActionExecution) -> Result<ActionExecution, LedgerError> {
        let started = self.ledger.start_action(&action.id)?;
        self.publish_status(&started);

        let sink = LedgerProgress {
            ledger: self.ledger.clone(),
            bus: self.bus.clone(),
            action_id: action.id.clone(),
            deployment_ids: deployment_ids(action),
            failure: Mutex::new(None),
        };
        let ctx = ActionContext {
            action_id: action.id.clone(),
            kind: action.kind,
            targets: &action.targets,
            parameters: &action.parameters,
            deadline: self.policy.timeout,
            poll_interval: self.policy.poll_interval,
            progress: &sink,
        };

        // Destructive actions run at most once.
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match actions::execute(&ctx, &self.collab).await {
                Outcome::Failure(failure)
                    if !action.kind.is_destructive() && gate::should_retry(&failure, attempts) =>
                {
                    warn!(action = %action.id, attempt = attempts, error = %failure.message, "retryable action failure, retrying");
                    tokio::time::sleep(self.policy.poll_interval).await;
                }
                other => break other,
            }
        };

        if let Some(err) = sink.take_failure() {
            return Err(err);
        }

        let outcome = match outcome {
            Outcome::Success(value) => ActionOutcome::Completed(value),
            Outcome::Failure(failure) => ActionOutcome::Failed(
                ErrorRecord::new(ErrorKind::ExternalFailure, None, failure.message)
                    .retryable(failure.retryable),
            ),
        };
        self.ledger.complete_action(&action.id, outcome)
    }

    /// A ledger write failed: record `PersistenceFailure` if the ledger
    /// still accepts writes, otherwise keep the outcome in memory.
    fn abandon(&self, mut action: ActionExecution, err: LedgerError) -> ActionExecution {
        error!(action = %action.id, error = %err, "ledger write failed, abandoning action");
        let record = ErrorRecord::new(ErrorKind::PersistenceFailure, None, err.to_string());
        match self
            .ledger
            .complete_action(&action.id, ActionOutcome::Failed(record.clone()))
        {
            Ok(done) => done,
            Err(again) => {
                error!(action = %action.id, error = %again, "terminal write failed, outcome kept in memory only");
                action.status = ExecutionStatus::Failed;
                action.error = Some(record);
                action.finished_at = Some(epoch_millis());
                action
            }
        }
    }

    fn publish_status(&self, action: &ActionExecution) {
        self.bus.publish(ExecutionEvent::new(
            action.id.clone(),
            deployment_ids(action),
            EventKind::ActionStatus {
                action: action.kind,
                status: action.status,
            },
        ));
    }
}

fn deployment_ids(action: &ActionExecution) -> Vec<String> {
    action
        .targets
        .iter()
        .map(|t| t.deployment_id.clone())
        .collect()
}

/// Forwards adapter progress to the ledger, then the bus.
struct LedgerProgress {
    ledger: Arc<dyn Ledger>,
    bus: EventBus,
    action_id: ActionId,
    deployment_ids: Vec<String>,
    /// First storage failure seen; ends the action once the adapter returns.
    failure: Mutex<Option<LedgerError>>,
}

impl LedgerProgress {
    fn take_failure(&self) -> Option<LedgerError> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl ProgressSink for LedgerProgress {
    fn report(&self, percent: u8, step: &str) {
        match self.ledger.set_progress(&self.action_id, percent, step) {
            Ok(action) => {
                debug!(action = %self.action_id, percent = action.progress, step, "progress");
                self.bus.publish(ExecutionEvent::new(
                    self.action_id.clone(),
                    self.deployment_ids.clone(),
                    EventKind::ActionProgress {
                        percent: action.progress,
                        step: step.to_string(),
                    },
                ));
            }
            Err(LedgerError::ProgressRegression { current, requested }) => {
                // A retried adapter starts over; the ledger keeps the high-water mark.
                debug!(action = %self.action_id, current, requested, "ignoring progress regression");
            }
            Err(err) => {
                let mut failure = self
                    .failure
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if failure.is_none() {
                    error!(action = %self.action_id, error = %err, "progress write failed");
                    *failure = Some(err);
                }
            }
        }
    }
}

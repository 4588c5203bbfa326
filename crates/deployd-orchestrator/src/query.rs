//! Read-only status surface over the ledger and the bus.

use std::sync::Arc;

use deploy_core::{ActionExecution, PipelineRun, Release};
use deployd_ledger::{Ledger, LedgerResult, RecoveryReport};

use crate::bus::{EventBus, EventFilter, Subscription};

#[derive(Clone)]
pub struct StatusService {
    ledger: Arc<dyn Ledger>,
    bus: EventBus,
}

impl StatusService {
    pub fn new(ledger: Arc<dyn Ledger>, bus: EventBus) -> Self {
        Self { ledger, bus }
    }

    pub fn get_run(&self, id: &str) -> LedgerResult<Option<PipelineRun>> {
        self.ledger.get_run(id)
    }

    pub fn get_action(&self, id: &str) -> LedgerResult<Option<ActionExecution>> {
        self.ledger.get_action(id)
    }

    pub fn list_runs_for_deployment(&self, deployment_id: &str) -> LedgerResult<Vec<PipelineRun>> {
        self.ledger.list_runs_for_deployment(deployment_id)
    }

    pub fn list_actions(&self) -> LedgerResult<Vec<ActionExecution>> {
        self.ledger.list_actions()
    }

    /// Actions that touched `deployment_id`, oldest first.
    pub fn list_actions_for_deployment(&self, deployment_id: &str) -> LedgerResult<Vec<ActionExecution>> {
        Ok(self
            .ledger
            .list_actions()?
            .into_iter()
            .filter(|a| a.targets_deployment(deployment_id))
            .collect())
    }

    pub fn latest_release(&self, deployment_id: &str) -> LedgerResult<Option<Release>> {
        self.ledger.latest_release(deployment_id)
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.bus.subscribe(filter)
    }

    /// Close out runs and actions a previous process left open. Call once
    /// at startup, before admitting new work.
    pub fn recover_interrupted(&self) -> LedgerResult<RecoveryReport> {
        self.ledger.recover_interrupted()
    }
}

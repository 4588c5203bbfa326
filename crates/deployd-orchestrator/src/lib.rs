//! deployd-orchestrator: admission, sequencing, and observation of
//! pipeline runs and remediation actions.
//!
//! The [`PipelineController`] and [`ActionRunner`] share one
//! [`ConcurrencyGuard`], one [`EventBus`], and the ledger. Nothing here is
//! a global: [`Orchestrator::new`] wires the pieces from injected handles.
//!
//! ```text
//! launch(deployment) ──► validate ──► guard ──► ledger.create_run ──► spawn
//!                                                                     │
//!      ┌──────────────────────────────────────────────────────────────┘
//!      ▼
//!  scan ─► gate ─► build ─► deploy ─► health ─► record release ─► Completed
//!                              │         │
//!                              └────┬────┘
//!                                   ▼
//!                        rollback (previous release) ─► RolledBack
//! ```

pub mod bus;
pub mod controller;
pub mod error;
pub mod guard;
pub mod query;
pub mod runner;

use std::sync::Arc;

use deploy_core::{ActionPolicy, PipelinePolicy};
use deployd_ledger::Ledger;
use deployd_phase::Collaborators;

pub use bus::{EventBus, EventFilter, EventKind, ExecutionEvent, Subscription};
pub use controller::{PipelineController, RunHandle};
pub use error::AdmissionError;
pub use guard::{ConcurrencyGuard, GuardKey, Lease};
pub use query::StatusService;
pub use runner::{ActionHandle, ActionRunner};

/// The controller, runner, and status surface over one ledger.
#[derive(Clone)]
pub struct Orchestrator {
    pub pipelines: PipelineController,
    pub actions: ActionRunner,
    pub status: StatusService,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        collab: Collaborators,
        pipeline: PipelinePolicy,
        actions: ActionPolicy,
        event_capacity: usize,
    ) -> Self {
        let guard = ConcurrencyGuard::new();
        let bus = EventBus::new(event_capacity);
        Self {
            pipelines: PipelineController::new(
                ledger.clone(),
                guard.clone(),
                bus.clone(),
                collab.clone(),
                pipeline,
            ),
            actions: ActionRunner::new(ledger.clone(), guard, bus.clone(), collab, actions),
            status: StatusService::new(ledger, bus),
        }
    }
}

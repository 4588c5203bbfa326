//! Event bus: best-effort fan-out of execution transitions.
//!
//! Backed by a bounded `tokio::sync::broadcast` channel. Publishing never
//! waits: with no subscribers the event is dropped, and a subscriber that
//! falls more than `capacity` events behind skips the oldest ones. Events
//! from one run are published from one task, so their order is preserved.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use deploy_core::{ActionKind, ExecutionStatus, PhaseKind, PipelineState, epoch_millis};

/// One observable transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionEvent {
    /// Run or action id.
    pub execution_id: String,
    /// Deployments the execution acts on.
    pub deployment_ids: Vec<String>,
    pub at: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunState {
        state: PipelineState,
    },
    PhaseCommitted {
        phase: PhaseKind,
        sequence: u32,
        attempts: u32,
        success: bool,
    },
    RunFinished {
        state: PipelineState,
        summary: String,
    },
    ActionStatus {
        action: ActionKind,
        status: ExecutionStatus,
    },
    ActionProgress {
        percent: u8,
        step: String,
    },
}

impl ExecutionEvent {
    pub fn new(execution_id: impl Into<String>, deployment_ids: Vec<String>, kind: EventKind) -> Self {
        Self {
            execution_id: execution_id.into(),
            deployment_ids,
            at: epoch_millis(),
            kind,
        }
    }
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Execution(String),
    Deployment(String),
}

impl EventFilter {
    pub fn matches(&self, event: &ExecutionEvent) -> bool {
        match self {
            Self::All => true,
            Self::Execution(id) => event.execution_id == *id,
            Self::Deployment(id) => event.deployment_ids.iter().any(|d| d == id),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // An error only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A filtered view of the bus.
pub struct Subscription {
    rx: broadcast::Receiver<ExecutionEvent>,
    filter: EventFilter,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged, oldest events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

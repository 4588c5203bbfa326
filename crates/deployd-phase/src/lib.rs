//! deployd-phase: the Phase Adapter contract and its implementations.
//!
//! Every external operation the orchestrator performs goes through this
//! crate: pipeline phases (scan, build, deploy, health check, rollback) and
//! remediation actions (scale, bulk stop, re-scan, restart). Adapters wrap
//! the collaborator traits, enforce the caller's deadline, and turn every
//! result into an [`Outcome`]. They never retry; that is the caller's call.
//!
//! # Architecture
//!
//! ```text
//! PhaseContext ──► pipeline::execute ──► match PhaseInput
//!                                         ├── Scanner::scan
//!                                         ├── ImageBuilder::build
//!                                         ├── ComputeApi::deploy (deploy, rollback)
//!                                         └── health::poll_until_healthy
//!                                               └── HealthProbe::check (HttpHealthProbe)
//!
//! ActionContext ──► actions::execute ──► match ActionKind
//!                                         └── ComputeApi / Scanner + ProgressSink
//! ```
//!
//! Gate and rollback decisions live in [`gate`]; they are pure functions
//! of a phase result and the rollback target.

pub mod actions;
pub mod contract;
pub mod gate;
pub mod health;
pub mod pipeline;
pub mod probe;

pub use actions::{ActionContext, ProgressSink};
pub use contract::{
    BoxFuture, CollaboratorError, Collaborators, ComputeApi, FailureKind, HealthProbe,
    HealthSample, ImageBuilder, InstanceDescription, InstanceState, Outcome, PhaseFailure,
    RepositoryReader, Scanner,
};
pub use gate::{FailureResponse, GateVerdict, MAX_ATTEMPTS};
pub use pipeline::{PhaseContext, PhaseInput};
pub use probe::HttpHealthProbe;

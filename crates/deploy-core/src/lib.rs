//! deploy-core: shared types for the deployd release orchestrator.
//!
//! Everything the ledger persists and the orchestrator passes around lives
//! here: deployment identities, pipeline runs and their phase results,
//! action executions, the error taxonomy, and `deployd.toml` parsing.

pub mod config;
pub mod error;
pub mod strategy;
pub mod types;

pub use config::{ActionPolicy, DeploydConfig, PipelinePolicy, parse_duration};
pub use error::{ConfigError, ErrorKind, ErrorRecord, ValidationError};
pub use strategy::{CanaryConfig, RollingConfig, RolloutStrategy};
pub use types::*;

/// Milliseconds since the unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

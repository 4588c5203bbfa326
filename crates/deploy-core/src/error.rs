//! Error taxonomy shared by pipeline runs and action executions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PhaseKind;

/// Classification recorded on a failed phase, run, or action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input, rejected before any side effect.
    ValidationFailure,
    /// Another run holds the same admission key.
    Busy,
    /// A scanner, builder, or compute call failed or timed out.
    ExternalFailure,
    /// Scan findings exceeded the configured gate.
    PolicyRejection,
    /// A ledger write failed.
    PersistenceFailure,
    /// The compensating rollback deploy failed.
    RollbackFailure,
    /// The run was still active when the process restarted.
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailure => "validation failure",
            Self::Busy => "busy",
            Self::ExternalFailure => "external failure",
            Self::PolicyRejection => "policy rejection",
            Self::PersistenceFailure => "persistence failure",
            Self::RollbackFailure => "rollback failure",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error as persisted on a phase result or terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    /// Phase the error occurred in, if any.
    pub phase: Option<PhaseKind>,
    pub message: String,
    pub retryable: bool,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, phase: Option<PhaseKind>, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "{} during {}: {}", self.kind, phase, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Input rejected at admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading `deployd.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_display_includes_phase() {
        let err = ErrorRecord::new(ErrorKind::ExternalFailure, Some(PhaseKind::Build), "exit 1");
        assert_eq!(err.to_string(), "external failure during build: exit 1");
        assert!(!err.retryable);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PolicyRejection).unwrap();
        assert_eq!(json, r#""policy_rejection""#);
    }
}

//! Admission errors returned synchronously by `launch` and `submit`.

use thiserror::Error;

use deploy_core::{ErrorKind, ValidationError};
use deployd_ledger::LedgerError;

/// Why a run or action was not admitted. No ledger record exists for
/// a request rejected with `Validation` or `Busy`.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("busy: {0}")]
    Busy(String),

    #[error("ledger write failed at admission: {0}")]
    Persistence(#[from] LedgerError),
}

impl AdmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationFailure,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Persistence(_) => ErrorKind::PersistenceFailure,
        }
    }
}

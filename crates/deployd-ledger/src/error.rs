//! Error types for the execution ledger.

use thiserror::Error;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("record is terminal: {0}")]
    Terminal(String),

    #[error("phase result out of order: expected sequence {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("progress may not decrease: current {current}, requested {requested}")]
    ProgressRegression { current: u8, requested: u8 },

    #[error("progress out of range: {0}")]
    InvalidProgress(u8),
}

impl LedgerError {
    /// Whether the error came from the storage engine rather than a
    /// rejected write.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Open(_)
                | Self::Transaction(_)
                | Self::Table(_)
                | Self::Read(_)
                | Self::Write(_)
                | Self::Serialize(_)
                | Self::Deserialize(_)
        )
    }
}

//! deployd-ledger: the execution ledger.
//!
//! Backed by [redb](https://docs.rs/redb). The ledger is the single source
//! of truth for every pipeline run and action execution: status, phase
//! results, progress, and terminal outcome. Release records (the last
//! healthy version per deployment) live alongside them as rollback targets.
//!
//! # Guarantees
//!
//! Every write is one redb write transaction, committed before the call
//! returns. Read-modify-write of a record happens inside that transaction,
//! so concurrent writers to different runs never interfere and a read
//! after a write always observes it.
//!
//! The [`Ledger`] trait is the seam the orchestrator depends on;
//! [`RedbLedger`] is the persistent implementation.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{LedgerError, LedgerResult};
pub use store::{Ledger, RecoveryReport, RedbLedger};

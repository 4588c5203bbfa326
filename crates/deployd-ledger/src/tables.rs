//! redb table definitions for the execution ledger.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Pipeline runs keyed by run id, phase results embedded in order.
pub const PIPELINE_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("pipeline_runs");

/// Action executions keyed by action id, progress history embedded.
pub const ACTION_EXECUTIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("action_executions");

/// Last healthy release keyed by deployment id.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

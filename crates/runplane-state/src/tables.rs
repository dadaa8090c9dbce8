//! redb table definitions for the Runplane state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Tasks keyed by zero-padded task ID (see [`crate::types::task_key`]).
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Workspaces keyed by `{workspace_id}`.
pub const WORKSPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("workspaces");

/// Agent pools keyed by `{pool_id}`.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Store-level counters (task ID sequence).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last allocated task ID.
pub const TASK_SEQ: &str = "task_seq";

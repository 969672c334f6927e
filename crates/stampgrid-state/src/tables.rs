//! redb table definitions for the durable worker table.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized).

use redb::TableDefinition;

/// Worker rows keyed by `{site}/{stamp}:{worker}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Manager slot (a serialized `WorkerKey`) keyed by `{site}`.
pub const MANAGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("managers");

/// Table lock lease keyed by `{site}`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

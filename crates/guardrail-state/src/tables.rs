//! redb table definitions for the Guardrail state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Circuit-breaker state keyed by scope (`global`, `tenant/{id}`).
pub const BREAKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("breakers");

/// The emergency controller's state under [`EMERGENCY_KEY`].
pub const EMERGENCY: TableDefinition<&str, &[u8]> = TableDefinition::new("emergency");

/// Latest recommended limits keyed by `{tenant}:{limit}`.
pub const RECOMMENDATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("recommendations");

pub const EMERGENCY_KEY: &str = "current";

//! redb table definitions for the Vigil state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Anomaly records keyed by anomaly ID (`anom-NNNNNN`).
pub const ANOMALIES: TableDefinition<&str, &[u8]> = TableDefinition::new("anomalies");

/// Scaling events keyed by event ID (`scale-NNNNNN`).
pub const SCALING_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("scaling_events");

/// Scaling policies keyed by policy ID.
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");

/// The singleton scaling state, stored under [`SCALING_STATE_KEY`].
pub const SCALING_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("scaling_state");

/// Key of the one row in [`SCALING_STATE`].
pub const SCALING_STATE_KEY: &str = "group";

//! redb table definitions for the fleet state store.
//!
//! Every table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// VM records keyed by `{vm_id}`. Rows are never removed.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Hardware templates keyed by `{template_id}`.
pub const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("templates");

/// Session records keyed by `{session_id}`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Status transitions keyed by `{vm_id}:{seq:08}`.
pub const TRANSITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transitions");

/// Aggregate metrics snapshots keyed by zero-padded epoch millis.
pub const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics");

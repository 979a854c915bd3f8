//! vmfleet-state: embedded state store for the VM fleet.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for VMs, templates, sessions, status transitions, and metrics
//! snapshots.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Transition history uses composite `{vm_id}:{seq}` keys so a VM's history
//! is a prefix scan.
//!
//! Multi-row updates go through [`StateStore::write`], which runs a closure
//! inside a single write transaction. redb serializes write transactions,
//! so a read-validate-write sequence inside `write` cannot interleave with
//! another one.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, StoreTxn};
pub use types::*;

//! vmfleet-metrics: observability for the VM fleet.
//!
//! Aggregates fleet-wide counts and capacity into periodic snapshots,
//! persists them to the state store, raises low-capacity alerts on the
//! event bus, and renders Prometheus-compatible text.
//!
//! # Architecture
//!
//! ```text
//! MetricsAggregator
//!   ├── compute() → OrchestratorMetrics (point-in-time, not persisted)
//!   ├── snapshot() → persists + emits VMPoolLowCapacity per short region
//!   └── run() → periodic snapshot loop
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for a /metrics endpoint
//! ```

pub mod aggregator;
pub mod prometheus;

pub use aggregator::{MetricsAggregator, aggregate};
pub use prometheus::render_prometheus;

//! vmfleet-orchestrator: one handle over the whole fleet.
//!
//! [`Orchestrator`] is constructed explicitly from a [`FleetConfig`] and a
//! [`StateStore`]; nothing is process-global, so tests can run many
//! isolated instances side by side.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!   ├── LifecycleEngine   (VM transitions, retries, sessions, backend)
//!   ├── RegionResolver    (capacity, fallback)
//!   ├── EventBus          (best-effort lifecycle events)
//!   └── start(shutdown)
//!       ├── HealthMonitor::run     → handle_vm_error(HEARTBEAT_TIMEOUT)
//!       ├── MetricsAggregator::run → metrics table + VMPoolLowCapacity
//!       └── retry context eviction
//! ```
//!
//! [`FleetConfig`]: vmfleet_core::FleetConfig
//! [`StateStore`]: vmfleet_state::StateStore

pub mod orchestrator;
pub mod request;

pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use request::{SessionRequest, SessionRequestOutcome};

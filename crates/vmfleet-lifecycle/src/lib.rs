//! vmfleet-lifecycle: VM state machine, retries, and session slots.
//!
//! [`LifecycleEngine`] is the only component that changes a VM's status.
//! Health monitoring and operator actions call into it rather than
//! writing VM rows themselves.
//!
//! # Architecture
//!
//! ```text
//! LifecycleEngine
//!   ├── StateStore     (VM / session rows, transition history)
//!   ├── EventBus       (best-effort lifecycle notifications)
//!   ├── Provisioner    (provision + boot, simulated by timers)
//!   ├── ComputeBackend (launch / stop workloads on a VM)
//!   ├── RetryPipeline  (per-VM attempt counters with TTL)
//!   └── TaskRegistry   (one abortable bring-up task per VM)
//! ```

pub mod backend;
pub mod engine;
pub mod error;
pub mod provisioner;
pub mod retry;
pub mod sessions;
pub mod tasks;

pub use backend::{
    BackendError, BackendHealth, ComputeBackend, NoopBackend, SimulatedBackend, build_backend,
};
pub use engine::{HeartbeatAck, LifecycleEngine};
pub use error::{ErrorClass, LifecycleError, LifecycleResult};
pub use provisioner::{ProvisionFailure, Provisioner, SimulatedProvisioner};
pub use retry::{RetryContext, RetryDecision, RetryPipeline, RetryPolicy};

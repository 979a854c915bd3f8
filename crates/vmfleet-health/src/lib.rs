//! vmfleet-health: heartbeat-based liveness for the VM fleet.
//!
//! The monitor sweeps the store on a fixed period and hands every VM
//! whose heartbeat has gone stale to a callback. It never writes VM
//! status itself; the orchestrator wires the callback to the lifecycle
//! engine's error path.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── run(): sleep(interval) / shutdown select loop
//!   ├── sweep_at(now)
//!   │   ├── StateStore::list_vms()  (point-in-time snapshot)
//!   │   └── assess(vm, now, policy) → Assessment
//!   └── UnhealthyCallback(vm_id, Assessment) for each stale VM
//! ```
//!
//! # Rules
//!
//! Only `READY`, `IN_USE`, `RUNNING` and `BOOTING` VMs are checked. A
//! booting VM that has never reported is in its grace period. Any other
//! VM that has never reported is unhealthy once it is older than
//! `never_seen_grace`. Otherwise a heartbeat at least
//! `heartbeat_timeout` old is unhealthy.

pub mod checker;
pub mod monitor;

pub use checker::{Assessment, HeartbeatPolicy, assess};
pub use monitor::{BoxFuture, HealthMonitor, UnhealthyCallback, UnhealthyVm};

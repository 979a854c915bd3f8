//! vmfleet-placement: where a new session should land.
//!
//! This crate only reads fleet state. It answers "which VM", "which
//! region" and "which template" questions; the lifecycle engine carries
//! out whatever the caller decides.
//!
//! # Components
//!
//! - **`regions`**: Static region table and fallback chains
//! - **`resolver`**: Per-region capacity and fallback resolution
//! - **`templates`**: Workload → template selection

pub mod regions;
pub mod resolver;
pub mod templates;

pub use regions::RegionTable;
pub use resolver::{
    QUEUE_SECONDS_PER_PROVISIONING_VM, RegionResolver, Resolution, VmMatch, available_vms_in,
    find_ready_vm, region_capacity_of, resolve_in,
};
pub use templates::select_template_for_workload;

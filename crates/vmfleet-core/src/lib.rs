//! vmfleet-core: shared vocabulary for the GPU VM fleet.
//!
//! Everything the other crates agree on lives here: the VM status
//! enum and its legal edges, error codes and their retry
//! classification, template/region catalog rows, and the TOML
//! configuration for the orchestrator daemon.

pub mod catalog;
pub mod config;
pub mod duration;
pub mod error_code;
pub mod status;

pub use catalog::{RegionConfig, SuggestedRange, VmTemplate, WorkloadProfile};
pub use config::{
    BackendConfig, BackendKind, ConfigError, FleetConfig, HealthConfig, MetricsConfig,
    ProvisioningConfig, RetryConfig,
};
pub use duration::parse_duration;
pub use error_code::ErrorCode;
pub use status::VmStatus;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

//! Heartbeat assessment for a single VM.

use std::fmt;
use std::time::Duration;

use vmfleet_core::{HealthConfig, VmStatus};
use vmfleet_state::VmRecord;

/// Thresholds a heartbeat is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// A heartbeat this old or older is stale.
    pub heartbeat_timeout: Duration,
    /// How long a non-booting VM may go without ever reporting.
    pub never_seen_grace: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            never_seen_grace: Duration::from_secs(120),
        }
    }
}

impl From<&HealthConfig> for HeartbeatPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout,
            never_seen_grace: config.never_seen_grace,
        }
    }
}

/// Outcome of checking one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// The status is not one the monitor watches.
    NotMonitored,
    Healthy,
    /// Booting and has not reported yet.
    BootGrace,
    /// Never reported, and older than the grace period.
    NeverSeen { age: Duration },
    /// Last heartbeat is at least the timeout old.
    Stale { age: Duration },
}

impl Assessment {
    /// Whether the VM should be failed with `HEARTBEAT_TIMEOUT`.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Assessment::NeverSeen { .. } | Assessment::Stale { .. })
    }
}

impl fmt::Display for Assessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assessment::NotMonitored => write!(f, "not monitored"),
            Assessment::Healthy => write!(f, "healthy"),
            Assessment::BootGrace => write!(f, "booting, no heartbeat yet"),
            Assessment::NeverSeen { age } => {
                write!(f, "no heartbeat received in {}s since creation", age.as_secs())
            }
            Assessment::Stale { age } => write!(f, "last heartbeat {}s ago", age.as_secs()),
        }
    }
}

fn elapsed(since_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(since_ms))
}

/// Judge `vm` at wall-clock `now_ms` (epoch milliseconds).
pub fn assess(vm: &VmRecord, now_ms: u64, policy: &HeartbeatPolicy) -> Assessment {
    if !vm.status.is_monitored() {
        return Assessment::NotMonitored;
    }
    match vm.last_heartbeat {
        None if vm.status == VmStatus::Booting => Assessment::BootGrace,
        None => {
            let age = elapsed(vm.created_at, now_ms);
            if age > policy.never_seen_grace {
                Assessment::NeverSeen { age }
            } else {
                Assessment::Healthy
            }
        }
        Some(at) => {
            let age = elapsed(at, now_ms);
            if age >= policy.heartbeat_timeout {
                Assessment::Stale { age }
            } else {
                Assessment::Healthy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_core::catalog::default_templates;

    const NOW: u64 = 10_000_000;

    fn vm(status: VmStatus, created_secs_ago: u64, heartbeat_secs_ago: Option<u64>) -> VmRecord {
        let mut vm = VmRecord::new("vm-1", &default_templates()[0], "us-east-1", NOW - created_secs_ago * 1000);
        vm.status = status;
        vm.last_heartbeat = heartbeat_secs_ago.map(|s| NOW - s * 1000);
        vm
    }

    #[test]
    fn stale_heartbeat_on_ready_vm_is_unhealthy() {
        let policy = HeartbeatPolicy::default();
        let stale = assess(&vm(VmStatus::Ready, 600, Some(61)), NOW, &policy);
        assert_eq!(stale, Assessment::Stale { age: Duration::from_secs(61) });
        assert!(stale.is_unhealthy());

        let fresh = assess(&vm(VmStatus::Ready, 600, Some(30)), NOW, &policy);
        assert_eq!(fresh, Assessment::Healthy);
    }

    #[test]
    fn timeout_boundary_counts_as_stale() {
        let policy = HeartbeatPolicy::default();
        assert!(assess(&vm(VmStatus::InUse, 600, Some(60)), NOW, &policy).is_unhealthy());
        assert!(!assess(&vm(VmStatus::InUse, 600, Some(59)), NOW, &policy).is_unhealthy());
    }

    #[test]
    fn booting_without_heartbeat_is_in_grace() {
        let policy = HeartbeatPolicy::default();
        assert_eq!(assess(&vm(VmStatus::Booting, 3600, None), NOW, &policy), Assessment::BootGrace);
        // Once it has reported, a booting VM is held to the timeout.
        assert!(assess(&vm(VmStatus::Booting, 3600, Some(90)), NOW, &policy).is_unhealthy());
    }

    #[test]
    fn never_seen_after_grace_is_unhealthy() {
        let policy = HeartbeatPolicy::default();
        assert_eq!(assess(&vm(VmStatus::Ready, 60, None), NOW, &policy), Assessment::Healthy);
        assert_eq!(
            assess(&vm(VmStatus::Ready, 121, None), NOW, &policy),
            Assessment::NeverSeen { age: Duration::from_secs(121) }
        );
    }

    #[test]
    fn unmonitored_statuses_are_skipped() {
        let policy = HeartbeatPolicy::default();
        for status in [VmStatus::Provisioning, VmStatus::Draining, VmStatus::Error, VmStatus::Terminated] {
            assert_eq!(assess(&vm(status, 3600, Some(3600)), NOW, &policy), Assessment::NotMonitored);
        }
    }

    #[test]
    fn policy_follows_config() {
        let config = HealthConfig {
            interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),
            never_seen_grace: Duration::from_secs(20),
        };
        let policy = HeartbeatPolicy::from(&config);
        assert!(assess(&vm(VmStatus::Ready, 600, Some(11)), NOW, &policy).is_unhealthy());
    }
}

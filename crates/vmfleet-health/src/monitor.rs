//! Health monitor: the periodic sweep over live VMs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vmfleet_core::{HealthConfig, VmStatus, epoch_millis};
use vmfleet_state::{StateResult, StateStore};

use crate::checker::{Assessment, HeartbeatPolicy, assess};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked once per unhealthy VM found by a sweep.
///
/// The orchestrator uses this to route the VM through the lifecycle
/// engine's error handling.
pub type UnhealthyCallback = Arc<dyn Fn(String, Assessment) -> BoxFuture + Send + Sync>;

/// A VM flagged by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhealthyVm {
    pub vm_id: String,
    pub status: VmStatus,
    pub assessment: Assessment,
}

pub struct HealthMonitor {
    state: StateStore,
    policy: HeartbeatPolicy,
    interval: Duration,
    on_unhealthy: Option<UnhealthyCallback>,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(state: StateStore, config: &HealthConfig) -> Self {
        Self {
            state,
            policy: HeartbeatPolicy::from(config),
            interval: config.interval,
            on_unhealthy: None,
        }
    }

    /// Set a callback for VMs found unhealthy.
    pub fn with_callback(mut self, callback: UnhealthyCallback) -> Self {
        self.on_unhealthy = Some(callback);
        self
    }

    /// Timeout rules the monitor applies.
    pub fn policy(&self) -> &HeartbeatPolicy {
        &self.policy
    }

    /// Time between sweeps.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check every VM against wall-clock `now_ms` and report the unhealthy
    /// ones to the callback.
    pub async fn sweep_at(&self, now_ms: u64) -> StateResult<Vec<UnhealthyVm>> {
        let vms = self.state.list_vms()?;
        let mut checked = 0usize;
        let mut unhealthy = Vec::new();

        for vm in &vms {
            let assessment = assess(vm, now_ms, &self.policy);
            if assessment == Assessment::NotMonitored {
                continue;
            }
            checked += 1;
            if assessment.is_unhealthy() {
                warn!(vm_id = %vm.id, status = %vm.status, %assessment, "VM unresponsive");
                unhealthy.push(UnhealthyVm {
                    vm_id: vm.id.clone(),
                    status: vm.status,
                    assessment,
                });
            }
        }

        if let Some(ref cb) = self.on_unhealthy {
            for vm in &unhealthy {
                cb(vm.vm_id.clone(), vm.assessment).await;
            }
        }

        debug!(checked, unhealthy = unhealthy.len(), "health sweep complete");
        Ok(unhealthy)
    }

    /// Sweep against the current wall clock.
    pub async fn sweep(&self) -> StateResult<Vec<UnhealthyVm>> {
        self.sweep_at(epoch_millis()).await
    }

    /// Sweep every `interval` until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, timeout = ?self.policy.heartbeat_timeout, "health monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "health sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use vmfleet_core::catalog::default_templates;
    use vmfleet_state::VmRecord;

    const NOW: u64 = 50_000_000;

    fn put(store: &StateStore, id: &str, status: VmStatus, heartbeat_secs_ago: Option<u64>) {
        let mut vm = VmRecord::new(id, &default_templates()[0], "us-east-1", NOW - 3_600_000);
        vm.status = status;
        vm.last_heartbeat = heartbeat_secs_ago.map(|s| NOW - s * 1000);
        store.put_vm(&vm).unwrap();
    }

    #[tokio::test]
    async fn sweep_reports_only_stale_vms() {
        let store = StateStore::open_in_memory().unwrap();
        put(&store, "stale", VmStatus::Ready, Some(61));
        put(&store, "fresh", VmStatus::Ready, Some(30));
        put(&store, "booting", VmStatus::Booting, None);
        put(&store, "errored", VmStatus::Error, Some(600));

        let monitor = HealthMonitor::new(store, &HealthConfig::default());
        let unhealthy = monitor.sweep_at(NOW).await.unwrap();

        assert_eq!(unhealthy.len(), 1);
        assert_eq!(unhealthy[0].vm_id, "stale");
        assert_eq!(unhealthy[0].status, VmStatus::Ready);
    }

    #[tokio::test]
    async fn callback_receives_each_unhealthy_vm() {
        let store = StateStore::open_in_memory().unwrap();
        put(&store, "a", VmStatus::InUse, Some(120));
        put(&store, "b", VmStatus::Ready, None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: UnhealthyCallback = Arc::new(move |vm_id: String, assessment: Assessment| -> BoxFuture {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push((vm_id, assessment));
            })
        });

        let monitor = HealthMonitor::new(store, &HealthConfig::default()).with_callback(callback);
        monitor.sweep_at(NOW).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0].1, Assessment::Stale { .. }));
        assert!(matches!(seen[1].1, Assessment::NeverSeen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let monitor = HealthMonitor::new(store, &HealthConfig::default());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(monitor.run(rx));
        tokio::time::sleep(Duration::from_secs(65)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

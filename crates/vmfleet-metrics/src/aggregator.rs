//! Metrics aggregator: periodic fleet-wide snapshots.
//!
//! Counts cover every VM row, terminated ones included. Capacity totals
//! only cover VMs that can still serve sessions (not `ERROR`,
//! `TERMINATING` or `TERMINATED`).

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vmfleet_core::{MetricsConfig, epoch_millis};
use vmfleet_events::{EventBus, LifecycleEvent};
use vmfleet_placement::{RegionTable, region_capacity_of};
use vmfleet_state::{OrchestratorMetrics, StateStore, VmRecord};

/// Fold a list of VMs into one snapshot taken at `timestamp`.
pub fn aggregate(vms: &[VmRecord], regions: &RegionTable, timestamp: u64) -> OrchestratorMetrics {
    let mut vms_by_status: BTreeMap<String, u32> = BTreeMap::new();
    let mut vms_by_region: BTreeMap<String, u32> = BTreeMap::new();
    let mut total_capacity = 0u32;
    let mut used_capacity = 0u32;

    for vm in vms {
        *vms_by_status.entry(vm.status.to_string()).or_default() += 1;
        *vms_by_region.entry(vm.region.clone()).or_default() += 1;
        if vm.status.is_live() {
            total_capacity += vm.max_sessions;
            used_capacity += vm.current_sessions;
        }
    }

    let available_capacity = total_capacity.saturating_sub(used_capacity);
    let utilization_percent = if total_capacity == 0 {
        0.0
    } else {
        f64::from(used_capacity) / f64::from(total_capacity) * 100.0
    };

    OrchestratorMetrics {
        timestamp,
        total_vms: vms.len() as u32,
        vms_by_status,
        vms_by_region,
        total_capacity,
        used_capacity,
        available_capacity,
        utilization_percent,
        region_capacities: regions.codes().map(|code| region_capacity_of(code, vms)).collect(),
    }
}

pub struct MetricsAggregator {
    state: StateStore,
    regions: RegionTable,
    events: EventBus,
    interval: Duration,
    low_capacity_threshold: u32,
}

impl MetricsAggregator {
    /// Create a new aggregator with the `[metrics]` settings.
    pub fn new(state: StateStore, regions: RegionTable, events: EventBus, config: &MetricsConfig) -> Self {
        Self {
            state,
            regions,
            events,
            interval: config.interval,
            low_capacity_threshold: config.low_capacity_threshold,
        }
    }

    /// Time between snapshots.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current metrics, without persisting anything.
    pub fn compute(&self) -> anyhow::Result<OrchestratorMetrics> {
        let vms = self.state.list_vms()?;
        Ok(aggregate(&vms, &self.regions, epoch_millis()))
    }

    /// Compute, persist, and alert on regions short of ready VMs.
    pub fn snapshot(&self) -> anyhow::Result<OrchestratorMetrics> {
        let metrics = self.compute()?;
        self.state.put_metrics(&metrics)?;

        for capacity in &metrics.region_capacities {
            if capacity.available_vms < self.low_capacity_threshold {
                warn!(
                    region = %capacity.region,
                    available = capacity.available_vms,
                    provisioning = capacity.vms_in_provisioning,
                    threshold = self.low_capacity_threshold,
                    "region low on ready VMs"
                );
                self.events.publish(LifecycleEvent::VmPoolLowCapacity {
                    region: capacity.region.clone(),
                    available_vms: capacity.available_vms,
                    threshold: self.low_capacity_threshold,
                });
            }
        }

        debug!(
            total_vms = metrics.total_vms,
            used = metrics.used_capacity,
            total = metrics.total_capacity,
            "metrics snapshot persisted"
        );
        Ok(metrics)
    }

    /// Snapshot every `interval` until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "metrics aggregator started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.snapshot() {
                        error!(error = %e, "metrics snapshot failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("metrics aggregator shutting down");
                    break;
                }
            }
        }
    }
}

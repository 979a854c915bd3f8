//! Region capacity and multi-region fallback.
//!
//! Resolution order for a request in region `T`:
//!
//! 1. a `READY` VM in `T` with enough free slots → match;
//! 2. `T` has any available or provisioning VMs → queue in `T`;
//! 3. the first fallback region of `T` with a fitting `READY` VM → match;
//! 4. nothing → exhausted.
//!
//! Same-region queuing wins over crossing regions whenever `T` shows any
//! pending supply.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vmfleet_core::VmStatus;
use vmfleet_state::{RegionCapacity, StateResult, StateStore, VmRecord};

use crate::regions::RegionTable;

/// Queue-time estimate contributed by each VM still coming up.
pub const QUEUE_SECONDS_PER_PROVISIONING_VM: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMatch {
    pub vm_id: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Matched(VmMatch),
    /// Capacity is expected soon in the requested region.
    Queued(RegionCapacity),
    Exhausted,
}

/// Capacity of `region` computed over a snapshot of VMs.
pub fn region_capacity_of(region: &str, vms: &[VmRecord]) -> RegionCapacity {
    let in_region = vms.iter().filter(|vm| vm.region == region);
    let mut available_vms = 0;
    let mut vms_in_provisioning = 0;
    for vm in in_region {
        if vm.status == VmStatus::Ready && vm.available_slots() > 0 {
            available_vms += 1;
        }
        if vm.status.is_starting() {
            vms_in_provisioning += 1;
        }
    }
    RegionCapacity {
        region: region.to_string(),
        available_vms,
        vms_in_provisioning,
        average_queue_time_secs: QUEUE_SECONDS_PER_PROVISIONING_VM * u64::from(vms_in_provisioning),
    }
}

/// Best `READY` VM in `region` with room for `sessions`: most free slots
/// first, oldest on a tie.
pub fn find_ready_vm<'a>(vms: &'a [VmRecord], region: &str, sessions: u32) -> Option<&'a VmRecord> {
    vms.iter()
        .filter(|vm| vm.region == region && vm.status == VmStatus::Ready && vm.has_room_for(sessions))
        .max_by(|a, b| {
            a.available_slots()
                .cmp(&b.available_slots())
                .then_with(|| b.created_at.cmp(&a.created_at))
        })
}

/// VMs in `region` that could take `sessions` more sessions right now,
/// most free slots first.
pub fn available_vms_in(vms: &[VmRecord], region: &str, sessions: u32) -> Vec<VmRecord> {
    let mut matches: Vec<VmRecord> = vms
        .iter()
        .filter(|vm| vm.region == region && vm.status.accepts_sessions() && vm.has_room_for(sessions))
        .cloned()
        .collect();
    matches.sort_by(|a, b| {
        b.available_slots()
            .cmp(&a.available_slots())
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    matches
}

/// Resolve against a point-in-time list of VMs.
pub fn resolve_in(vms: &[VmRecord], regions: &RegionTable, target: &str, sessions: u32) -> Resolution {
    let sessions = sessions.max(1);

    if let Some(vm) = find_ready_vm(vms, target, sessions) {
        return Resolution::Matched(VmMatch {
            vm_id: vm.id.clone(),
            region: vm.region.clone(),
        });
    }

    let capacity = region_capacity_of(target, vms);
    if capacity.available_vms > 0 || capacity.vms_in_provisioning > 0 {
        return Resolution::Queued(capacity);
    }

    for fallback in regions.fallbacks(target) {
        if let Some(vm) = find_ready_vm(vms, fallback, sessions) {
            debug!(%target, region = %fallback, vm_id = %vm.id, "falling back to another region");
            return Resolution::Matched(VmMatch {
                vm_id: vm.id.clone(),
                region: vm.region.clone(),
            });
        }
    }
    Resolution::Exhausted
}

/// Store-backed resolver over the configured region table.
#[derive(Clone)]
pub struct RegionResolver {
    store: StateStore,
    regions: RegionTable,
}

impl RegionResolver {
    /// Create a resolver over the store and region table.
    pub fn new(store: StateStore, regions: RegionTable) -> Self {
        Self { store, regions }
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    /// Capacity snapshot for one region.
    pub fn region_capacity(&self, region: &str) -> StateResult<RegionCapacity> {
        let vms = self.store.list_vms_by_region(region)?;
        Ok(region_capacity_of(region, &vms))
    }

    /// Capacity of every configured region, in declaration order.
    pub fn all_region_capacities(&self) -> StateResult<Vec<RegionCapacity>> {
        let vms = self.store.list_vms()?;
        Ok(self
            .regions
            .codes()
            .map(|code| region_capacity_of(code, &vms))
            .collect())
    }

    /// Decide where `sessions` new sessions for `target` should go.
    pub fn resolve(&self, target: &str, sessions: u32) -> StateResult<Resolution> {
        let vms = self.store.list_vms()?;
        let resolution = resolve_in(&vms, &self.regions, target, sessions);
        match &resolution {
            Resolution::Matched(m) => debug!(%target, vm_id = %m.vm_id, region = %m.region, "VM resolved"),
            Resolution::Queued(c) => debug!(%target, provisioning = c.vms_in_provisioning, "request queued in region"),
            Resolution::Exhausted => warn!(%target, sessions, "no capacity in region or fallbacks"),
        }
        Ok(resolution)
    }

    /// A VM for `sessions` sessions in `target` or one of its fallbacks.
    /// `None` when queued or exhausted.
    pub fn find_vm_with_fallback(&self, target: &str, sessions: u32) -> StateResult<Option<VmMatch>> {
        match self.resolve(target, sessions)? {
            Resolution::Matched(m) => Ok(Some(m)),
            Resolution::Queued(_) | Resolution::Exhausted => Ok(None),
        }
    }

    /// VMs in `region` with room for `sessions`, roomiest first.
    pub fn available_vms_for_sessions(&self, region: &str, sessions: u32) -> StateResult<Vec<VmRecord>> {
        let vms = self.store.list_vms_by_region(region)?;
        Ok(available_vms_in(&vms, region, sessions.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_core::RegionConfig;
    use vmfleet_core::catalog::default_templates;

    fn vm(id: &str, region: &str, status: VmStatus, current: u32, max: u32, created_at: u64) -> VmRecord {
        let mut vm = VmRecord::new(id, &default_templates()[0], region, created_at);
        vm.status = status;
        vm.current_sessions = current;
        vm.max_sessions = max;
        vm
    }

    fn region(code: &str, fallbacks: &[&str]) -> RegionConfig {
        RegionConfig {
            code: code.to_string(),
            name: code.to_uppercase(),
            continent: String::new(),
            fallback_regions: fallbacks.iter().map(|s| s.to_string()).collect(),
            legal_constraints: Vec::new(),
        }
    }

    fn abc() -> RegionTable {
        RegionTable::new(vec![region("A", &["B", "C"]), region("B", &[]), region("C", &[])])
    }

    #[test]
    fn capacity_counts_ready_with_room_and_starting() {
        let vms = vec![
            vm("1", "A", VmStatus::Ready, 0, 2, 0),
            vm("2", "A", VmStatus::Ready, 2, 2, 0),
            vm("3", "A", VmStatus::InUse, 1, 2, 0),
            vm("4", "A", VmStatus::Provisioning, 0, 2, 0),
            vm("5", "A", VmStatus::Booting, 0, 2, 0),
            vm("6", "B", VmStatus::Ready, 0, 2, 0),
        ];
        let capacity = region_capacity_of("A", &vms);
        assert_eq!(capacity.available_vms, 1);
        assert_eq!(capacity.vms_in_provisioning, 2);
        assert_eq!(capacity.average_queue_time_secs, 30);
    }

    #[test]
    fn prefers_most_free_slots_then_oldest() {
        let vms = vec![
            vm("busy", "A", VmStatus::Ready, 3, 4, 0),
            vm("young", "A", VmStatus::Ready, 0, 4, 20),
            vm("old", "A", VmStatus::Ready, 0, 4, 10),
        ];
        assert_eq!(find_ready_vm(&vms, "A", 1).unwrap().id, "old");
        assert_eq!(find_ready_vm(&vms, "A", 4).unwrap().id, "old");
        assert!(find_ready_vm(&vms, "A", 5).is_none());
    }

    #[test]
    fn falls_back_in_declared_order() {
        let vms = vec![
            vm("b1", "B", VmStatus::Ready, 0, 2, 0),
            vm("c1", "C", VmStatus::Ready, 0, 4, 0),
        ];
        let resolution = resolve_in(&vms, &abc(), "A", 1);
        assert_eq!(
            resolution,
            Resolution::Matched(VmMatch { vm_id: "b1".into(), region: "B".into() })
        );
    }

    #[test]
    fn pending_supply_in_target_queues_instead_of_falling_back() {
        let vms = vec![
            vm("a1", "A", VmStatus::Booting, 0, 2, 0),
            vm("b1", "B", VmStatus::Ready, 0, 2, 0),
        ];
        match resolve_in(&vms, &abc(), "A", 1) {
            Resolution::Queued(capacity) => {
                assert_eq!(capacity.region, "A");
                assert_eq!(capacity.vms_in_provisioning, 1);
            }
            other => panic!("expected queued, got {other:?}"),
        }
    }

    #[test]
    fn ready_vm_without_enough_slots_still_queues() {
        let vms = vec![
            vm("a1", "A", VmStatus::Ready, 1, 2, 0),
            vm("b1", "B", VmStatus::Ready, 0, 4, 0),
        ];
        assert!(matches!(resolve_in(&vms, &abc(), "A", 2), Resolution::Queued(_)));
    }

    #[test]
    fn exhausted_when_no_region_has_capacity() {
        let vms = vec![vm("c1", "C", VmStatus::InUse, 4, 4, 0)];
        assert_eq!(resolve_in(&vms, &abc(), "A", 1), Resolution::Exhausted);
        assert_eq!(resolve_in(&vms, &abc(), "unknown", 1), Resolution::Exhausted);
    }

    #[test]
    fn available_vms_include_in_use_with_room() {
        let vms = vec![
            vm("r", "A", VmStatus::Ready, 0, 2, 0),
            vm("u", "A", VmStatus::InUse, 1, 4, 0),
            vm("full", "A", VmStatus::InUse, 4, 4, 0),
            vm("d", "A", VmStatus::Draining, 0, 4, 0),
        ];
        let ids: Vec<_> = available_vms_in(&vms, "A", 1).into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec!["u", "r"]);
    }

    #[test]
    fn resolver_reads_from_store() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_vm(&vm("b1", "B", VmStatus::Ready, 0, 2, 0)).unwrap();
        let resolver = RegionResolver::new(store, abc());

        let found = resolver.find_vm_with_fallback("A", 1).unwrap().unwrap();
        assert_eq!(found.region, "B");
        let all = resolver.all_region_capacities().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].available_vms, 1);
        assert_eq!(resolver.region_capacity("A").unwrap().available_vms, 0);
    }
}

//! Records persisted by the fleet state store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vmfleet_core::{ErrorCode, VmStatus, VmTemplate};

pub type VmId = String;
pub type SessionId = String;

// ── VM ─────────────────────────────────────────────────────────────

/// A provisioned compute unit and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: VmId,
    pub template_id: String,
    pub region: String,
    pub status: VmStatus,
    /// Always within `0..=max_sessions`.
    pub current_sessions: u32,
    /// Copied from the template at creation.
    pub max_sessions: u32,
    /// Epoch millis.
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Epoch millis of the last heartbeat, if any was ever received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<u64>,
    /// Number of status transitions recorded for this VM.
    #[serde(default)]
    pub transition_count: u32,
}

impl VmRecord {
    /// A fresh `PENDING` VM built from `template`.
    pub fn new(id: impl Into<String>, template: &VmTemplate, region: impl Into<String>, now: u64) -> Self {
        Self {
            id: id.into(),
            template_id: template.id.clone(),
            region: region.into(),
            status: VmStatus::Pending,
            current_sessions: 0,
            max_sessions: template.max_concurrent_sessions,
            created_at: now,
            updated_at: now,
            error_code: None,
            error_message: None,
            last_heartbeat: None,
            transition_count: 0,
        }
    }

    /// Free session slots.
    pub fn available_slots(&self) -> u32 {
        self.max_sessions.saturating_sub(self.current_sessions)
    }

    /// Whether `sessions` more fit.
    pub fn has_room_for(&self, sessions: u32) -> bool {
        self.current_sessions.saturating_add(sessions) <= self.max_sessions
    }

    pub fn capacity(&self) -> VmCapacity {
        let utilization_percent = if self.max_sessions == 0 {
            0.0
        } else {
            f64::from(self.current_sessions) / f64::from(self.max_sessions) * 100.0
        };
        VmCapacity {
            current_sessions: self.current_sessions,
            max_sessions: self.max_sessions,
            available_slots: self.available_slots(),
            utilization_percent,
        }
    }
}

/// Session occupancy of a single VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCapacity {
    pub current_sessions: u32,
    pub max_sessions: u32,
    pub available_slots: u32,
    pub utilization_percent: f64,
}

/// One edge taken by a VM's status, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub vm_id: VmId,
    pub seq: u32,
    /// `None` for the row that created the VM.
    pub from: Option<VmStatus>,
    pub to: VmStatus,
    pub reason: String,
    pub at: u64,
}

impl StatusTransition {
    pub fn table_key(&self) -> String {
        format!("{}:{:08}", self.vm_id, self.seq)
    }
}

// ── Sessions ───────────────────────────────────────────────────────

/// Persistent session row. `vm_id` is set while the session holds a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<VmId>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<u64>,
}

impl SessionRecord {
    /// A session not yet bound to a VM.
    pub fn new(id: impl Into<String>, now: u64) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            game_id: None,
            vm_id: None,
            created_at: now,
            assigned_at: None,
        }
    }

    /// The session-to-VM binding, if the session currently holds a slot.
    pub fn assignment(&self) -> Option<SessionAssignment> {
        let vm_id = self.vm_id.clone()?;
        Some(SessionAssignment {
            session_id: self.id.clone(),
            vm_id,
            user_id: self.user_id.clone(),
            game_id: self.game_id.clone(),
            assigned_at: self.assigned_at.unwrap_or(self.created_at),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAssignment {
    pub session_id: SessionId,
    pub vm_id: VmId,
    pub user_id: Option<String>,
    pub game_id: Option<String>,
    pub assigned_at: u64,
}

// ── Capacity & metrics ─────────────────────────────────────────────

/// Point-in-time supply for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCapacity {
    pub region: String,
    /// `READY` VMs with at least one free slot.
    pub available_vms: u32,
    /// VMs in `PROVISIONING` or `BOOTING`.
    pub vms_in_provisioning: u32,
    /// Seconds; `15 × vms_in_provisioning`.
    pub average_queue_time_secs: u64,
}

/// Aggregate fleet snapshot produced by the metrics aggregator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub timestamp: u64,
    pub total_vms: u32,
    pub vms_by_status: BTreeMap<String, u32>,
    pub vms_by_region: BTreeMap<String, u32>,
    pub total_capacity: u32,
    pub used_capacity: u32,
    pub available_capacity: u32,
    pub utilization_percent: f64,
    pub region_capacities: Vec<RegionCapacity>,
}

impl OrchestratorMetrics {
    pub fn table_key(&self) -> String {
        format!("{:020}", self.timestamp)
    }
}

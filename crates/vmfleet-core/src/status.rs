//! VM lifecycle status and the table of legal transitions.
//!
//! ```text
//! PENDING → PROVISIONING → BOOTING → READY ⇄ ASSIGNING_SESSION → IN_USE
//!                 │            │       │                          │
//!                 └────────────┴───────┴──────────→ ERROR ←───────┤
//!                                      │                          │
//!                                      └──────→ DRAINING ←────────┘
//! any non-terminal ─→ TERMINATING ─→ TERMINATED
//! ERROR ─→ PROVISIONING | BOOTING   (retry re-drive)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    /// Base image placeholder, never scheduled.
    Template,
    Pending,
    Provisioning,
    Booting,
    Ready,
    /// Transient marker while a session is being bound.
    AssigningSession,
    InUse,
    /// Synonym of `InUse`.
    Running,
    Draining,
    Terminating,
    Error,
    Terminated,
}

impl VmStatus {
    pub const ALL: [VmStatus; 12] = [
        VmStatus::Template,
        VmStatus::Pending,
        VmStatus::Provisioning,
        VmStatus::Booting,
        VmStatus::Ready,
        VmStatus::AssigningSession,
        VmStatus::InUse,
        VmStatus::Running,
        VmStatus::Draining,
        VmStatus::Terminating,
        VmStatus::Error,
        VmStatus::Terminated,
    ];

    /// Wire name, e.g. `IN_USE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Template => "TEMPLATE",
            VmStatus::Pending => "PENDING",
            VmStatus::Provisioning => "PROVISIONING",
            VmStatus::Booting => "BOOTING",
            VmStatus::Ready => "READY",
            VmStatus::AssigningSession => "ASSIGNING_SESSION",
            VmStatus::InUse => "IN_USE",
            VmStatus::Running => "RUNNING",
            VmStatus::Draining => "DRAINING",
            VmStatus::Terminating => "TERMINATING",
            VmStatus::Error => "ERROR",
            VmStatus::Terminated => "TERMINATED",
        }
    }

    /// `IN_USE` and `RUNNING` are the same state under two names.
    pub fn is_in_use(&self) -> bool {
        matches!(self, VmStatus::InUse | VmStatus::Running)
    }

    /// Statuses that accept a new session binding.
    pub fn accepts_sessions(&self) -> bool {
        matches!(self, VmStatus::Ready | VmStatus::InUse | VmStatus::Running)
    }

    /// Statuses from which `ERROR` may be entered.
    pub fn can_fail(&self) -> bool {
        matches!(
            self,
            VmStatus::Provisioning
                | VmStatus::Booting
                | VmStatus::Ready
                | VmStatus::InUse
                | VmStatus::Running
                | VmStatus::Draining
        )
    }

    /// Still coming up: provisioning or booting.
    pub fn is_starting(&self) -> bool {
        matches!(self, VmStatus::Provisioning | VmStatus::Booting)
    }

    /// Statuses the health monitor expects heartbeats from.
    pub fn is_monitored(&self) -> bool {
        matches!(
            self,
            VmStatus::Ready | VmStatus::InUse | VmStatus::Running | VmStatus::Booting
        )
    }

    /// Counts towards fleet capacity (not failed, not going away).
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            VmStatus::Template | VmStatus::Error | VmStatus::Terminating | VmStatus::Terminated
        )
    }

    /// `TERMINATED`: nothing can happen to the VM any more.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Terminated)
    }

    /// Whether `self → to` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, to: VmStatus) -> bool {
        use VmStatus::*;

        if to == Terminating {
            return !matches!(self, Terminating | Terminated);
        }
        if to == Error {
            return self.can_fail();
        }

        match (self, to) {
            (Pending, Provisioning) => true,
            (Provisioning, Booting | Ready) => true,
            (Booting, Ready) => true,
            (Ready, AssigningSession | Draining) => true,
            (AssigningSession, InUse | Ready) => true,
            (InUse | Running, AssigningSession | Ready | Draining) => true,
            (Error, Provisioning | Booting) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VmStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown VM status: {s}"))
    }
}

//! vmfleet-events: lifecycle notifications for observers.
//!
//! Events are published on a `tokio::sync::broadcast` channel. Delivery
//! is best-effort: a publish with no subscribers, or to a subscriber that
//! has fallen behind, is dropped. Nothing in the orchestrator reads
//! events back to make decisions.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;
use vmfleet_core::ErrorCode;

const DEFAULT_CAPACITY: usize = 256;

/// A lifecycle transition or fleet condition worth telling someone about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    #[serde(rename = "VMProvisioned")]
    VmProvisioned {
        vm_id: String,
        template_id: String,
        region: String,
    },
    #[serde(rename = "VMReady")]
    VmReady { vm_id: String, region: String },
    #[serde(rename = "VMError")]
    VmError {
        vm_id: String,
        code: ErrorCode,
        message: String,
        /// Whether the retry pipeline will re-drive the VM.
        retrying: bool,
    },
    #[serde(rename = "VMTerminated")]
    VmTerminated { vm_id: String, reason: String },
    SessionAssigned {
        vm_id: String,
        session_id: String,
        current_sessions: u32,
    },
    SessionReleased {
        vm_id: String,
        session_id: String,
        current_sessions: u32,
    },
    #[serde(rename = "VMPoolLowCapacity")]
    VmPoolLowCapacity {
        region: String,
        available_vms: u32,
        threshold: u32,
    },
}

impl LifecycleEvent {
    /// Wire name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::VmProvisioned { .. } => "VMProvisioned",
            LifecycleEvent::VmReady { .. } => "VMReady",
            LifecycleEvent::VmError { .. } => "VMError",
            LifecycleEvent::VmTerminated { .. } => "VMTerminated",
            LifecycleEvent::SessionAssigned { .. } => "SessionAssigned",
            LifecycleEvent::SessionReleased { .. } => "SessionReleased",
            LifecycleEvent::VmPoolLowCapacity { .. } => "VMPoolLowCapacity",
        }
    }

    /// The VM the event is about, if any.
    pub fn vm_id(&self) -> Option<&str> {
        match self {
            LifecycleEvent::VmProvisioned { vm_id, .. }
            | LifecycleEvent::VmReady { vm_id, .. }
            | LifecycleEvent::VmError { vm_id, .. }
            | LifecycleEvent::VmTerminated { vm_id, .. }
            | LifecycleEvent::SessionAssigned { vm_id, .. }
            | LifecycleEvent::SessionReleased { vm_id, .. } => Some(vm_id),
            LifecycleEvent::VmPoolLowCapacity { .. } => None,
        }
    }
}

/// An event stamped with its publish time (epoch millis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish and log an event. Returns how many subscribers it reached.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        info!(event = event.name(), vm_id = event.vm_id().unwrap_or("-"), ?event, "lifecycle event");
        let envelope = EventEnvelope {
            timestamp: vmfleet_core::epoch_millis(),
            event,
        };
        self.tx.send(envelope).unwrap_or(0)
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

//! Per-VM background task tracking.
//!
//! At most one provisioning/boot/retry drive runs per VM. Spawning a new
//! drive aborts the previous one, and terminating or failing a VM from
//! outside aborts whatever is still scheduled for it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

struct TaskSlot {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskRegistry {
    slots: Mutex<HashMap<String, TaskSlot>>,
    next_id: AtomicU64,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the future built by `make` as the drive for `vm_id`.
    ///
    /// `make` receives the task id the future must pass to
    /// [`TaskRegistry::finish`] when it is done.
    pub async fn spawn<F, Fut>(&self, vm_id: &str, make: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Held across the spawn so a fast task cannot finish before its slot exists.
        let mut slots = self.slots.lock().await;
        let handle = tokio::spawn(make(id));
        if let Some(previous) = slots.insert(vm_id.to_string(), TaskSlot { id, handle }) {
            previous.handle.abort();
            debug!(%vm_id, task_id = previous.id, "replaced pending VM task");
        }
    }

    /// Abort the pending task for `vm_id`, if any.
    pub async fn abort(&self, vm_id: &str) -> bool {
        match self.slots.lock().await.remove(vm_id) {
            Some(slot) => {
                slot.handle.abort();
                debug!(%vm_id, task_id = slot.id, "aborted pending VM task");
                true
            }
            None => false,
        }
    }

    /// Called by a task on completion. Leaves newer tasks for the VM alone.
    pub async fn finish(&self, vm_id: &str, id: u64) {
        let mut slots = self.slots.lock().await;
        if slots.get(vm_id).is_some_and(|slot| slot.id == id) {
            slots.remove(vm_id);
        }
    }

    /// Whether a task is still registered for `vm_id`.
    pub async fn is_pending(&self, vm_id: &str) -> bool {
        self.slots.lock().await.contains_key(vm_id)
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Abort every registered task.
    pub async fn abort_all(&self) {
        let mut slots = self.slots.lock().await;
        for (_, slot) in slots.drain() {
            slot.handle.abort();
        }
    }
}

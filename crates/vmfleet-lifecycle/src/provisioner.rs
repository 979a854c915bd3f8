//! Provisioning seam: the part of VM bring-up that talks to a cloud.
//!
//! [`SimulatedProvisioner`] stands in for the cloud API with fixed
//! delays. Failures can be queued up front to exercise the retry path.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use vmfleet_core::{ErrorCode, ProvisioningConfig};
use vmfleet_state::VmRecord;

/// A failed provisioning or boot step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionFailure {
    pub code: ErrorCode,
    pub message: String,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Allocate the machine. Resolves once the VM can start booting.
    async fn provision(&self, vm: &VmRecord) -> Result<(), ProvisionFailure>;

    /// Boot the machine. Resolves once the VM can accept sessions.
    async fn boot(&self, vm: &VmRecord) -> Result<(), ProvisionFailure>;
}

pub struct SimulatedProvisioner {
    provision_delay: Duration,
    boot_delay: Duration,
    provision_failures: Mutex<VecDeque<ErrorCode>>,
    boot_failures: Mutex<VecDeque<ErrorCode>>,
}

impl SimulatedProvisioner {
    /// Create a provisioner that takes the given time per step.
    pub fn new(provision_delay: Duration, boot_delay: Duration) -> Self {
        Self {
            provision_delay,
            boot_delay,
            provision_failures: Mutex::new(VecDeque::new()),
            boot_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a provisioner with the `[provisioning]` delays.
    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self::new(config.provision_delay, config.boot_delay)
    }

    /// Make the next `count` provisioning attempts fail with `code`.
    pub async fn fail_next_provisions(&self, count: usize, code: ErrorCode) {
        let mut queue = self.provision_failures.lock().await;
        queue.extend(std::iter::repeat_n(code, count));
    }

    /// Make the next `count` boot attempts fail with `code`.
    pub async fn fail_next_boots(&self, count: usize, code: ErrorCode) {
        let mut queue = self.boot_failures.lock().await;
        queue.extend(std::iter::repeat_n(code, count));
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn provision(&self, vm: &VmRecord) -> Result<(), ProvisionFailure> {
        tokio::time::sleep(self.provision_delay).await;
        if let Some(code) = self.provision_failures.lock().await.pop_front() {
            return Err(ProvisionFailure {
                code,
                message: format!("simulated provisioning failure for VM {}", vm.id),
            });
        }
        debug!(vm_id = %vm.id, "simulated provisioning complete");
        Ok(())
    }

    async fn boot(&self, vm: &VmRecord) -> Result<(), ProvisionFailure> {
        tokio::time::sleep(self.boot_delay).await;
        if let Some(code) = self.boot_failures.lock().await.pop_front() {
            return Err(ProvisionFailure {
                code,
                message: format!("simulated boot failure for VM {}", vm.id),
            });
        }
        debug!(vm_id = %vm.id, "simulated boot complete");
        Ok(())
    }
}

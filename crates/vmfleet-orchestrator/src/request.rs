//! Session requests: find capacity for a new session, or start some.

use serde::{Deserialize, Serialize};
use tracing::info;

use vmfleet_core::WorkloadProfile;
use vmfleet_lifecycle::{LifecycleError, LifecycleResult};
use vmfleet_placement::{Resolution, select_template_for_workload};

use crate::orchestrator::Orchestrator;

/// A caller asking for somewhere to run a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub user_id: String,
    pub game_id: String,
    pub region: String,
    #[serde(default)]
    pub workload: WorkloadProfile,
}

impl SessionRequest {
    /// Request for a session with the default workload.
    pub fn new(user_id: impl Into<String>, game_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            game_id: game_id.into(),
            region: region.into(),
            workload: WorkloadProfile::default(),
        }
    }

    pub fn with_workload(mut self, workload: WorkloadProfile) -> Self {
        self.workload = workload;
        self
    }

    fn validate(&self) -> LifecycleResult<()> {
        for (field, value) in [("user id", &self.user_id), ("game id", &self.game_id), ("region", &self.region)] {
            if value.trim().is_empty() {
                return Err(LifecycleError::Validation(format!("{field} is required")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionRequestOutcome {
    /// A `READY` VM has room now.
    Ready { vm_id: String, region: String },
    /// A new VM was created for the request and is coming up.
    Provisioning {
        vm_id: String,
        region: String,
        template_id: String,
    },
    /// The requested region has supply on the way; ask again later.
    Queued {
        region: String,
        vms_in_provisioning: u32,
        estimated_wait_secs: u64,
    },
}

impl SessionRequestOutcome {
    /// The VM the session should go to, unless queued.
    pub fn vm_id(&self) -> Option<&str> {
        match self {
            SessionRequestOutcome::Ready { vm_id, .. } | SessionRequestOutcome::Provisioning { vm_id, .. } => {
                Some(vm_id)
            }
            SessionRequestOutcome::Queued { .. } => None,
        }
    }
}

impl Orchestrator {
    /// Allocate capacity for a new session.
    ///
    /// An existing VM in the region or one of its fallbacks is preferred.
    /// When the region already has VMs on the way the request is queued.
    /// Otherwise a VM is created from the template best matching the
    /// workload. Session records themselves are not created here.
    pub async fn request_session(&self, request: &SessionRequest) -> LifecycleResult<SessionRequestOutcome> {
        request.validate()?;
        if self.resolver.regions().get(&request.region).is_none() {
            return Err(LifecycleError::Validation(format!("unknown region: {}", request.region)));
        }

        match self.resolver.resolve(&request.region, 1)? {
            Resolution::Matched(found) => {
                info!(user_id = %request.user_id, vm_id = %found.vm_id, region = %found.region, "session request matched");
                Ok(SessionRequestOutcome::Ready {
                    vm_id: found.vm_id,
                    region: found.region,
                })
            }
            Resolution::Queued(capacity) => Ok(SessionRequestOutcome::Queued {
                region: capacity.region,
                vms_in_provisioning: capacity.vms_in_provisioning,
                estimated_wait_secs: capacity.average_queue_time_secs,
            }),
            Resolution::Exhausted => {
                let templates = self.list_templates()?;
                let template = select_template_for_workload(&templates, &request.workload)
                    .ok_or_else(|| LifecycleError::TemplateNotFound("no template in catalog".into()))?;
                let vm = self.create_vm(&template.id, &request.region).await?;
                info!(
                    user_id = %request.user_id,
                    game_id = %request.game_id,
                    vm_id = %vm.id,
                    template_id = %template.id,
                    "no capacity; provisioning a new VM"
                );
                Ok(SessionRequestOutcome::Provisioning {
                    vm_id: vm.id,
                    region: vm.region,
                    template_id: template.id.clone(),
                })
            }
        }
    }
}

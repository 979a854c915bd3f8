//! LifecycleEngine: sole writer of VM status.
//!
//! Every status change goes through [`apply_transition`] inside a store
//! write transaction, which checks the edge against
//! [`VmStatus::can_transition_to`] and appends the transition history row
//! in the same commit.
//!
//! Provisioning and boot run as one tracked tokio task per VM (the
//! "drive"). A failed step is recorded as `ERROR` and handed to the
//! [`RetryPipeline`]; if a retry is granted the same task sleeps out the
//! backoff and re-enters the failed step.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;
use vmfleet_core::{ErrorCode, VmStatus, epoch_millis};
use vmfleet_events::{EventBus, LifecycleEvent};
use vmfleet_state::{StateStore, StatusTransition, StoreTxn, VmRecord};

use crate::backend::{BackendHealth, ComputeBackend};
use crate::error::{LifecycleError, LifecycleResult};
use crate::provisioner::Provisioner;
use crate::retry::{RetryContext, RetryDecision, RetryPipeline, RetryPolicy, is_retry_eligible};
use crate::tasks::TaskRegistry;

/// Agent-reported health strings that count as a failure.
const UNHEALTHY_REPORTS: [&str; 2] = ["unhealthy", "error"];

/// The step of bring-up a drive is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Provision,
    Boot,
}

impl Stage {
    fn status(self) -> VmStatus {
        match self {
            Stage::Provision => VmStatus::Provisioning,
            Stage::Boot => VmStatus::Booting,
        }
    }

    fn for_status(status: VmStatus) -> Option<Stage> {
        match status {
            VmStatus::Provisioning => Some(Stage::Provision),
            VmStatus::Booting => Some(Stage::Boot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    Run(Stage),
    RetryAfter(Duration, Stage),
}

/// Acknowledgement returned to a heartbeating agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub vm_id: String,
    pub session_id: Option<String>,
    pub status: VmStatus,
    pub received_at: u64,
}

/// Move `vm` along `to`, recording the edge. Fails on an illegal edge.
pub(crate) fn apply_transition(
    txn: &StoreTxn<'_>,
    vm: &mut VmRecord,
    to: VmStatus,
    reason: &str,
    now: u64,
) -> LifecycleResult<()> {
    if !vm.status.can_transition_to(to) {
        return Err(LifecycleError::InvalidTransition {
            vm_id: vm.id.clone(),
            from: vm.status,
            to,
        });
    }
    txn.append_transition(&StatusTransition {
        vm_id: vm.id.clone(),
        seq: vm.transition_count,
        from: Some(vm.status),
        to,
        reason: reason.to_string(),
        at: now,
    })?;
    vm.status = to;
    vm.updated_at = now;
    vm.transition_count += 1;
    Ok(())
}

pub(crate) fn load_vm(txn: &StoreTxn<'_>, vm_id: &str) -> LifecycleResult<VmRecord> {
    txn.get_vm(vm_id)?
        .ok_or_else(|| LifecycleError::VmNotFound(vm_id.to_string()))
}

pub(crate) struct EngineInner {
    pub(crate) store: StateStore,
    pub(crate) events: EventBus,
    pub(crate) provisioner: Arc<dyn Provisioner>,
    pub(crate) backend: Arc<dyn ComputeBackend>,
    pub(crate) retry: RetryPipeline,
    pub(crate) tasks: TaskRegistry,
}

/// Cloneable handle; clones share the same store, tasks and retry state.
#[derive(Clone)]
pub struct LifecycleEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl LifecycleEngine {
    /// Create an engine. No tasks run until a VM is created.
    pub fn new(
        store: StateStore,
        events: EventBus,
        provisioner: Arc<dyn Provisioner>,
        backend: Arc<dyn ComputeBackend>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                events,
                provisioner,
                backend,
                retry: RetryPipeline::new(retry_policy),
                tasks: TaskRegistry::new(),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.inner.retry.policy()
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Fetch a VM or fail with `VmNotFound`.
    pub fn get_vm(&self, vm_id: &str) -> LifecycleResult<VmRecord> {
        self.inner
            .store
            .get_vm(vm_id)?
            .ok_or_else(|| LifecycleError::VmNotFound(vm_id.to_string()))
    }

    /// Status history of a VM, oldest first.
    pub fn transitions(&self, vm_id: &str) -> LifecycleResult<Vec<StatusTransition>> {
        self.get_vm(vm_id)?;
        Ok(self.inner.store.list_transitions(vm_id)?)
    }

    /// Current retry bookkeeping for a VM, if it is retrying.
    pub async fn retry_context(&self, vm_id: &str) -> Option<RetryContext> {
        self.inner.retry.context(vm_id).await
    }

    /// Drop retry contexts idle past their TTL.
    pub async fn evict_stale_retries(&self) -> usize {
        self.inner.retry.evict_expired().await
    }

    /// Whether a provisioning/boot/retry task is still scheduled for the VM.
    pub async fn has_pending_task(&self, vm_id: &str) -> bool {
        self.inner.tasks.is_pending(vm_id).await
    }

    /// Health report from the compute backend.
    pub async fn backend_health(&self) -> BackendHealth {
        self.inner.backend.health().await
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    // ── Explicit transitions ───────────────────────────────────────

    /// Create a VM from a template and start bringing it up in the background.
    ///
    /// Returns as soon as the VM is in `PROVISIONING`.
    pub async fn create_vm(&self, template_id: &str, region: &str) -> LifecycleResult<VmRecord> {
        if template_id.trim().is_empty() {
            return Err(LifecycleError::Validation("template id is required".into()));
        }
        if region.trim().is_empty() {
            return Err(LifecycleError::Validation("region is required".into()));
        }

        let vm_id = Uuid::new_v4().to_string();
        let now = epoch_millis();
        let vm = self.inner.store.write(|txn| {
            let template = txn
                .get_template(template_id)?
                .ok_or_else(|| LifecycleError::TemplateNotFound(template_id.to_string()))?;
            let mut vm = VmRecord::new(vm_id.clone(), &template, region, now);
            txn.append_transition(&StatusTransition {
                vm_id: vm.id.clone(),
                seq: 0,
                from: None,
                to: VmStatus::Pending,
                reason: format!("created from template {template_id}"),
                at: now,
            })?;
            vm.transition_count = 1;
            apply_transition(txn, &mut vm, VmStatus::Provisioning, "provisioning started", now)?;
            txn.put_vm(&vm)?;
            Ok::<_, LifecycleError>(vm)
        })?;

        info!(vm_id = %vm.id, %template_id, %region, "VM created");
        self.inner.events.publish(LifecycleEvent::VmProvisioned {
            vm_id: vm.id.clone(),
            template_id: vm.template_id.clone(),
            region: vm.region.clone(),
        });
        self.spawn_drive(&vm.id, Step::Run(Stage::Provision)).await;
        Ok(vm)
    }

    /// Mark a VM ready from `BOOTING` or `PROVISIONING`, cancelling any
    /// simulated bring-up still pending for it.
    pub async fn mark_ready(&self, vm_id: &str) -> LifecycleResult<VmRecord> {
        let current = self.get_vm(vm_id)?;
        if !current.status.is_starting() {
            return Err(LifecycleError::InvalidTransition {
                vm_id: vm_id.to_string(),
                from: current.status,
                to: VmStatus::Ready,
            });
        }
        self.inner.tasks.abort(vm_id).await;
        self.complete_ready(vm_id, &[VmStatus::Booting, VmStatus::Provisioning], "marked ready")
            .await?
            .ok_or_else(|| LifecycleError::InvalidTransition {
                vm_id: vm_id.to_string(),
                from: current.status,
                to: VmStatus::Ready,
            })
    }

    /// Stop taking new sessions on a `READY` or `IN_USE` VM.
    pub async fn mark_draining(&self, vm_id: &str) -> LifecycleResult<VmRecord> {
        let now = epoch_millis();
        let vm = self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            if !matches!(vm.status, VmStatus::Ready | VmStatus::InUse | VmStatus::Running) {
                return Err(LifecycleError::InvalidTransition {
                    vm_id: vm_id.to_string(),
                    from: vm.status,
                    to: VmStatus::Draining,
                });
            }
            apply_transition(txn, &mut vm, VmStatus::Draining, "draining", now)?;
            txn.put_vm(&vm)?;
            Ok::<_, LifecycleError>(vm)
        })?;
        info!(%vm_id, sessions = vm.current_sessions, "VM draining");
        Ok(vm)
    }

    /// Put a VM into `ERROR` and let the retry pipeline decide whether to
    /// re-drive it.
    ///
    /// A VM already in `ERROR` is returned unchanged; whoever failed it
    /// first owns the retry decision.
    pub async fn handle_vm_error(
        &self,
        vm_id: &str,
        code: ErrorCode,
        message: &str,
    ) -> LifecycleResult<VmRecord> {
        let (vm, prior) = self.write_error(vm_id, &code, message)?;
        let Some(prior) = prior else {
            debug!(%vm_id, %code, "VM already in ERROR; report ignored");
            return Ok(vm);
        };
        // Only now is the drive stale: its next write re-checks status.
        self.inner.tasks.abort(vm_id).await;
        let (vm, next) = self.after_error(vm, prior, code, message).await?;
        if let Some(step) = next {
            self.spawn_drive(vm_id, step).await;
        }
        Ok(vm)
    }

    /// Force-terminate a VM. Sessions still bound to it are released.
    ///
    /// Terminating an already `TERMINATED` VM returns it unchanged.
    pub async fn terminate_vm(&self, vm_id: &str, reason: Option<&str>) -> LifecycleResult<VmRecord> {
        let reason = reason.unwrap_or("terminated by request");
        self.inner.tasks.abort(vm_id).await;
        self.inner.retry.clear(vm_id).await;

        let now = epoch_millis();
        let (vm, released, had_sessions) = self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            if vm.status.is_terminal() {
                return Ok((vm, Vec::new(), false));
            }
            if vm.status != VmStatus::Terminating {
                apply_transition(txn, &mut vm, VmStatus::Terminating, reason, now)?;
            }
            let mut released = Vec::new();
            for mut session in txn.list_sessions_for_vm(vm_id)? {
                session.vm_id = None;
                txn.put_session(&session)?;
                released.push(session.id);
            }
            let had_sessions = vm.current_sessions > 0;
            vm.current_sessions = 0;
            txn.put_vm(&vm)?;
            Ok::<_, LifecycleError>((vm, released, had_sessions))
        })?;
        if vm.status.is_terminal() {
            debug!(%vm_id, "VM already terminated");
            return Ok(vm);
        }

        for session_id in released {
            self.inner.events.publish(LifecycleEvent::SessionReleased {
                vm_id: vm_id.to_string(),
                session_id,
                current_sessions: 0,
            });
        }
        if had_sessions {
            self.stop_workload_best_effort(vm_id).await;
        }

        let now = epoch_millis();
        let vm = self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            if vm.status == VmStatus::Terminating {
                apply_transition(txn, &mut vm, VmStatus::Terminated, reason, now)?;
                txn.put_vm(&vm)?;
            }
            Ok::<_, LifecycleError>(vm)
        })?;

        info!(%vm_id, %reason, "VM terminated");
        self.inner.events.publish(LifecycleEvent::VmTerminated {
            vm_id: vm_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(vm)
    }

    /// Record a liveness signal from a VM agent.
    ///
    /// A reported status of `unhealthy` or `error` fails the VM with
    /// `HEARTBEAT_UNHEALTHY`. A healthy heartbeat does not bring a VM back
    /// out of `ERROR`.
    pub async fn heartbeat(
        &self,
        vm_id: &str,
        session_id: Option<&str>,
        health_status: Option<&str>,
    ) -> LifecycleResult<HeartbeatAck> {
        let now = epoch_millis();
        let mut vm = self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            if vm.status.is_terminal() {
                return Err(LifecycleError::InvalidStatus {
                    vm_id: vm_id.to_string(),
                    status: vm.status,
                    expected: "any status except TERMINATED",
                });
            }
            vm.last_heartbeat = Some(now);
            txn.put_vm(&vm)?;
            Ok::<_, LifecycleError>(vm)
        })?;
        debug!(%vm_id, ?session_id, ?health_status, "heartbeat");

        let reported_unhealthy = health_status
            .map(|s| UNHEALTHY_REPORTS.iter().any(|u| s.trim().eq_ignore_ascii_case(u)))
            .unwrap_or(false);

        if reported_unhealthy {
            if vm.status.can_fail() {
                let report = health_status.unwrap_or_default();
                vm = self
                    .handle_vm_error(vm_id, ErrorCode::HeartbeatUnhealthy, &format!("agent reported {report}"))
                    .await?;
            } else {
                warn!(%vm_id, status = %vm.status, "unhealthy heartbeat ignored in current status");
            }
        } else if vm.status == VmStatus::Error {
            info!(%vm_id, "heartbeat from VM in ERROR; leaving it for operator action");
        }

        Ok(HeartbeatAck {
            vm_id: vm.id,
            session_id: session_id.map(str::to_string),
            status: vm.status,
            received_at: now,
        })
    }

    /// Abort every background drive, e.g. on shutdown.
    pub async fn shutdown(&self) {
        self.inner.tasks.abort_all().await;
    }

    // ── Background drive ───────────────────────────────────────────

    pub(crate) async fn spawn_drive(&self, vm_id: &str, step: Step) {
        let engine = self.clone();
        let owned_id = vm_id.to_string();
        self.inner
            .tasks
            .spawn(vm_id, move |task_id| async move {
                engine.drive(&owned_id, step).await;
                engine.inner.tasks.finish(&owned_id, task_id).await;
            })
            .await;
    }

    async fn drive(&self, vm_id: &str, mut step: Step) {
        loop {
            let stage = match step {
                Step::Run(stage) => stage,
                Step::RetryAfter(delay, stage) => {
                    tokio::time::sleep(delay).await;
                    match self.redrive(vm_id, stage) {
                        Ok(true) => stage,
                        Ok(false) => return,
                        Err(e) => {
                            warn!(%vm_id, error = %e, "retry re-drive failed");
                            return;
                        }
                    }
                }
            };
            match self.run_stage(vm_id, stage).await {
                Ok(Some(next)) => step = next,
                Ok(None) => return,
                Err(e) => {
                    warn!(%vm_id, ?stage, error = %e, "VM drive stopped");
                    return;
                }
            }
        }
    }

    /// Run one bring-up step. Returns the next step, or `None` when done.
    async fn run_stage(&self, vm_id: &str, stage: Stage) -> LifecycleResult<Option<Step>> {
        let vm = self.get_vm(vm_id)?;
        if vm.status != stage.status() {
            debug!(%vm_id, status = %vm.status, ?stage, "VM moved on; dropping stale step");
            return Ok(None);
        }

        let outcome = match stage {
            Stage::Provision => self.inner.provisioner.provision(&vm).await,
            Stage::Boot => self.inner.provisioner.boot(&vm).await,
        };

        match (stage, outcome) {
            (Stage::Provision, Ok(())) => {
                let now = epoch_millis();
                let advanced = self.inner.store.write(|txn| {
                    let mut vm = load_vm(txn, vm_id)?;
                    if vm.status != VmStatus::Provisioning {
                        return Ok(false);
                    }
                    apply_transition(txn, &mut vm, VmStatus::Booting, "provisioned", now)?;
                    txn.put_vm(&vm)?;
                    Ok::<_, LifecycleError>(true)
                })?;
                if advanced {
                    info!(%vm_id, "VM booting");
                    Ok(Some(Step::Run(Stage::Boot)))
                } else {
                    Ok(None)
                }
            }
            (Stage::Boot, Ok(())) => {
                self.complete_ready(vm_id, &[VmStatus::Booting], "booted").await?;
                Ok(None)
            }
            (_, Err(failure)) => {
                let (vm, prior) = self.write_error(vm_id, &failure.code, &failure.message)?;
                match prior {
                    Some(prior) => {
                        let (_, next) = self.after_error(vm, prior, failure.code, &failure.message).await?;
                        Ok(next)
                    }
                    None => {
                        debug!(%vm_id, "VM failed elsewhere first; dropping step");
                        Ok(None)
                    }
                }
            }
        }
    }

    /// `ERROR → PROVISIONING | BOOTING` ahead of a retry. `false` if the
    /// VM left `ERROR` while the backoff elapsed.
    fn redrive(&self, vm_id: &str, stage: Stage) -> LifecycleResult<bool> {
        let now = epoch_millis();
        let redriven = self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            if vm.status != VmStatus::Error {
                return Ok(false);
            }
            apply_transition(txn, &mut vm, stage.status(), "retry", now)?;
            vm.error_code = None;
            vm.error_message = None;
            txn.put_vm(&vm)?;
            Ok::<_, LifecycleError>(true)
        })?;
        if redriven {
            info!(%vm_id, ?stage, "retrying VM bring-up");
        }
        Ok(redriven)
    }

    /// Move to `READY` if the VM is in one of `from`. Clears retry state and
    /// emits `VMReady`. `None` if the VM was elsewhere.
    async fn complete_ready(
        &self,
        vm_id: &str,
        from: &[VmStatus],
        reason: &str,
    ) -> LifecycleResult<Option<VmRecord>> {
        let now = epoch_millis();
        let vm = self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            if !from.contains(&vm.status) {
                return Ok(None);
            }
            apply_transition(txn, &mut vm, VmStatus::Ready, reason, now)?;
            vm.error_code = None;
            vm.error_message = None;
            txn.put_vm(&vm)?;
            Ok::<_, LifecycleError>(Some(vm))
        })?;

        if let Some(vm) = &vm {
            self.inner.retry.clear(vm_id).await;
            info!(%vm_id, region = %vm.region, "VM ready");
            self.inner.events.publish(LifecycleEvent::VmReady {
                vm_id: vm.id.clone(),
                region: vm.region.clone(),
            });
        }
        Ok(vm)
    }

    /// Write `ERROR`, returning the status it replaced. `None` when the VM
    /// was already in `ERROR`, in which case nothing is written.
    fn write_error(
        &self,
        vm_id: &str,
        code: &ErrorCode,
        message: &str,
    ) -> LifecycleResult<(VmRecord, Option<VmStatus>)> {
        let now = epoch_millis();
        self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            if vm.status == VmStatus::Error {
                return Ok((vm, None));
            }
            let prior = vm.status;
            apply_transition(txn, &mut vm, VmStatus::Error, code.as_str(), now)?;
            vm.error_code = Some(code.clone());
            vm.error_message = Some(message.to_string());
            txn.put_vm(&vm)?;
            Ok::<_, LifecycleError>((vm, Some(prior)))
        })
    }

    /// Consult the retry pipeline for a VM just moved from `prior` to
    /// `ERROR`. Does not touch tasks, so it is safe to call from inside a
    /// drive.
    async fn after_error(
        &self,
        vm: VmRecord,
        prior: VmStatus,
        code: ErrorCode,
        message: &str,
    ) -> LifecycleResult<(VmRecord, Option<Step>)> {
        let vm_id = vm.id.as_str();
        let decision = match Stage::for_status(prior) {
            Some(stage) if is_retry_eligible(&code, prior) => {
                Some((self.inner.retry.record_failure(vm_id, &code, message).await, stage))
            }
            _ => {
                self.inner.retry.clear(vm_id).await;
                None
            }
        };

        let next = match decision {
            Some((RetryDecision::Retry { attempt, delay }, stage)) => {
                warn!(%vm_id, %code, attempt, delay_ms = delay.as_millis() as u64, "VM failed; retrying");
                Some(Step::RetryAfter(delay, stage))
            }
            _ => {
                warn!(%vm_id, %code, %message, prior = %prior, "VM failed");
                None
            }
        };
        self.inner.events.publish(LifecycleEvent::VmError {
            vm_id: vm_id.to_string(),
            code: code.clone(),
            message: message.to_string(),
            retrying: next.is_some(),
        });

        if let Some((RetryDecision::Exhausted { attempts }, stage)) = decision {
            let vm = self.escalate(vm_id, stage, attempts, message)?;
            return Ok((vm, None));
        }
        Ok((vm, next))
    }

    /// Rewrite the error as terminal once retries ran out.
    fn escalate(&self, vm_id: &str, stage: Stage, attempts: u32, last_message: &str) -> LifecycleResult<VmRecord> {
        let code = match stage {
            Stage::Provision => ErrorCode::ProvisioningFailed,
            Stage::Boot => ErrorCode::BootFailed,
        };
        let message = format!("failed after {attempts} retries: {last_message}");
        let vm = self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            vm.error_code = Some(code.clone());
            vm.error_message = Some(message.clone());
            vm.updated_at = epoch_millis();
            txn.put_vm(&vm)?;
            Ok::<_, LifecycleError>(vm)
        })?;
        warn!(%vm_id, %code, "retries exhausted; VM needs operator action");
        self.inner.events.publish(LifecycleEvent::VmError {
            vm_id: vm_id.to_string(),
            code,
            message,
            retrying: false,
        });
        Ok(vm)
    }

    pub(crate) async fn stop_workload_best_effort(&self, vm_id: &str) {
        if let Err(e) = self.inner.backend.stop_workload(vm_id).await {
            warn!(%vm_id, backend = self.inner.backend.name(), error = %e, "failed to stop workload");
        }
    }
}

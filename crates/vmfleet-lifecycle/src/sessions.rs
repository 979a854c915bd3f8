//! Session assignment: binding sessions to VM slots.
//!
//! Assign and release run as a single store write transaction each, so
//! the capacity check and the counter update cannot be split by a
//! concurrent request.

use tracing::{debug, info, warn};
use vmfleet_core::{VmStatus, epoch_millis};
use vmfleet_events::LifecycleEvent;
use vmfleet_state::{SessionAssignment, SessionRecord, VmCapacity, VmRecord};

use crate::engine::{LifecycleEngine, apply_transition, load_vm};
use crate::error::{LifecycleError, LifecycleResult};

impl LifecycleEngine {
    /// Bind `session_id` to a slot on `vm_id`.
    ///
    /// Re-assigning a session to the VM it already holds is a no-op.
    pub async fn assign_session(&self, vm_id: &str, session_id: &str) -> LifecycleResult<VmRecord> {
        if session_id.trim().is_empty() {
            return Err(LifecycleError::Validation("session id is required".into()));
        }

        let now = epoch_millis();
        let (vm, assigned) = self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            let mut session = txn
                .get_session(session_id)?
                .unwrap_or_else(|| SessionRecord::new(session_id, now));

            match session.vm_id.as_deref() {
                Some(bound) if bound == vm_id => return Ok((vm, false)),
                Some(bound) => {
                    return Err(LifecycleError::SessionAlreadyAssigned {
                        session_id: session_id.to_string(),
                        vm_id: bound.to_string(),
                    });
                }
                None => {}
            }
            if !vm.status.accepts_sessions() {
                return Err(LifecycleError::InvalidStatus {
                    vm_id: vm_id.to_string(),
                    status: vm.status,
                    expected: "READY, IN_USE or RUNNING",
                });
            }
            if vm.current_sessions >= vm.max_sessions {
                return Err(LifecycleError::AtCapacity {
                    vm_id: vm_id.to_string(),
                    current: vm.current_sessions,
                    max: vm.max_sessions,
                });
            }

            let reason = format!("session {session_id}");
            apply_transition(txn, &mut vm, VmStatus::AssigningSession, &reason, now)?;
            vm.current_sessions += 1;
            apply_transition(txn, &mut vm, VmStatus::InUse, &reason, now)?;
            txn.put_vm(&vm)?;

            session.vm_id = Some(vm_id.to_string());
            session.assigned_at = Some(now);
            txn.put_session(&session)?;
            Ok::<_, LifecycleError>((vm, true))
        })?;

        if assigned {
            info!(%vm_id, %session_id, sessions = vm.current_sessions, max = vm.max_sessions, "session assigned");
            self.inner.events.publish(LifecycleEvent::SessionAssigned {
                vm_id: vm_id.to_string(),
                session_id: session_id.to_string(),
                current_sessions: vm.current_sessions,
            });
        } else {
            debug!(%vm_id, %session_id, "session already assigned to this VM");
        }
        Ok(vm)
    }

    /// Free the slot `session_id` holds on `vm_id`.
    ///
    /// Releasing a session that holds no slot on the VM, or releasing from
    /// a VM with no sessions, returns the VM unchanged. A session bound to
    /// a different VM is an error.
    pub async fn release_session(&self, vm_id: &str, session_id: &str) -> LifecycleResult<VmRecord> {
        let now = epoch_millis();
        let (vm, released, went_idle) = self.inner.store.write(|txn| {
            let mut vm = load_vm(txn, vm_id)?;
            let Some(mut session) = txn.get_session(session_id)? else {
                return Ok((vm, false, false));
            };
            match session.vm_id.as_deref() {
                Some(bound) if bound == vm_id => {}
                Some(_) => {
                    return Err(LifecycleError::SessionNotOnVm {
                        session_id: session_id.to_string(),
                        vm_id: vm_id.to_string(),
                    });
                }
                None => return Ok((vm, false, false)),
            }

            session.vm_id = None;
            txn.put_session(&session)?;
            if vm.current_sessions == 0 {
                return Ok((vm, false, false));
            }

            vm.current_sessions -= 1;
            let mut went_idle = false;
            if vm.current_sessions == 0 && vm.status.is_in_use() {
                apply_transition(txn, &mut vm, VmStatus::Ready, &format!("session {session_id} released"), now)?;
                went_idle = true;
            } else {
                vm.updated_at = now;
            }
            txn.put_vm(&vm)?;
            Ok::<_, LifecycleError>((vm, true, went_idle))
        })?;

        if released {
            info!(%vm_id, %session_id, sessions = vm.current_sessions, status = %vm.status, "session released");
            self.inner.events.publish(LifecycleEvent::SessionReleased {
                vm_id: vm_id.to_string(),
                session_id: session_id.to_string(),
                current_sessions: vm.current_sessions,
            });
        }
        if went_idle {
            self.stop_workload_best_effort(vm_id).await;
        }
        Ok(vm)
    }

    /// Create or update the persistent record for a session.
    pub async fn register_session(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        game_id: Option<&str>,
    ) -> LifecycleResult<SessionRecord> {
        if session_id.trim().is_empty() {
            return Err(LifecycleError::Validation("session id is required".into()));
        }
        let now = epoch_millis();
        let session = self.inner.store.write(|txn| {
            let mut session = txn
                .get_session(session_id)?
                .unwrap_or_else(|| SessionRecord::new(session_id, now));
            if let Some(user_id) = user_id {
                session.user_id = Some(user_id.to_string());
            }
            if let Some(game_id) = game_id {
                session.game_id = Some(game_id.to_string());
            }
            txn.put_session(&session)?;
            Ok::<_, LifecycleError>(session)
        })?;
        debug!(%session_id, "session registered");
        Ok(session)
    }

    /// Fetch a session record.
    pub fn get_session(&self, session_id: &str) -> LifecycleResult<SessionRecord> {
        self.inner
            .store
            .get_session(session_id)?
            .ok_or_else(|| LifecycleError::SessionNotFound(session_id.to_string()))
    }

    /// End a session, freeing its VM slot if it holds one.
    pub async fn end_session(&self, session_id: &str) -> LifecycleResult<Option<VmRecord>> {
        let session = self.get_session(session_id)?;
        match session.vm_id {
            Some(vm_id) => Ok(Some(self.release_session(&vm_id, session_id).await?)),
            None => {
                debug!(%session_id, "ended session held no VM");
                Ok(None)
            }
        }
    }

    /// Sessions currently bound to `vm_id`.
    pub fn vm_sessions(&self, vm_id: &str) -> LifecycleResult<Vec<SessionAssignment>> {
        self.get_vm(vm_id)?;
        let sessions = self.inner.store.list_sessions_for_vm(vm_id)?;
        Ok(sessions.iter().filter_map(SessionRecord::assignment).collect())
    }

    /// Slot usage of `vm_id`.
    pub fn vm_capacity(&self, vm_id: &str) -> LifecycleResult<VmCapacity> {
        Ok(self.get_vm(vm_id)?.capacity())
    }

    /// Whether `count` more sessions could be assigned right now.
    pub fn can_vm_accept_sessions(&self, vm_id: &str, count: u32) -> LifecycleResult<bool> {
        let vm = self.get_vm(vm_id)?;
        Ok(vm.status.accepts_sessions() && vm.has_room_for(count))
    }

    /// Start a workload on a VM that is serving sessions.
    pub async fn launch_workload(&self, vm_id: &str, workload_id: &str) -> LifecycleResult<()> {
        let vm = self.get_vm(vm_id)?;
        if !vm.status.is_in_use() {
            return Err(LifecycleError::InvalidStatus {
                vm_id: vm_id.to_string(),
                status: vm.status,
                expected: "IN_USE or RUNNING",
            });
        }
        self.inner.backend.launch_workload(vm_id, workload_id).await?;
        info!(%vm_id, %workload_id, backend = self.inner.backend.name(), "workload launched");
        Ok(())
    }

    /// Stop whatever the backend runs on `vm_id`.
    pub async fn stop_workload(&self, vm_id: &str) -> LifecycleResult<()> {
        self.get_vm(vm_id)?;
        if let Err(e) = self.inner.backend.stop_workload(vm_id).await {
            warn!(%vm_id, error = %e, "stop workload failed");
            return Err(e.into());
        }
        Ok(())
    }
}

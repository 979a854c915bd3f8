//! Compute/session control-plane seam.
//!
//! The orchestrator only ever asks the control plane three things: is it
//! healthy, start a workload on a VM, stop whatever runs on a VM.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use vmfleet_core::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("workload rejected on VM {vm_id}: {reason}")]
    Rejected { vm_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHealth {
    Healthy,
    Degraded(String),
    Unavailable(String),
}

impl BackendHealth {
    /// Whether workloads can be launched.
    pub fn is_healthy(&self) -> bool {
        matches!(self, BackendHealth::Healthy)
    }
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn health(&self) -> BackendHealth;

    async fn launch_workload(&self, vm_id: &str, workload_id: &str) -> Result<(), BackendError>;

    /// Stop whatever runs on `vm_id`. Stopping an idle VM succeeds.
    async fn stop_workload(&self, vm_id: &str) -> Result<(), BackendError>;
}

/// In-process backend that records which workload runs where.
#[derive(Default)]
pub struct SimulatedBackend {
    running: Mutex<HashMap<String, String>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workload currently launched on `vm_id`.
    pub async fn running_workload(&self, vm_id: &str) -> Option<String> {
        self.running.lock().await.get(vm_id).cloned()
    }
}

#[async_trait]
impl ComputeBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth::Healthy
    }

    async fn launch_workload(&self, vm_id: &str, workload_id: &str) -> Result<(), BackendError> {
        if workload_id.trim().is_empty() {
            return Err(BackendError::Rejected {
                vm_id: vm_id.to_string(),
                reason: "empty workload id".to_string(),
            });
        }
        self.running
            .lock()
            .await
            .insert(vm_id.to_string(), workload_id.to_string());
        debug!(%vm_id, %workload_id, "workload launched");
        Ok(())
    }

    async fn stop_workload(&self, vm_id: &str) -> Result<(), BackendError> {
        if let Some(workload_id) = self.running.lock().await.remove(vm_id) {
            debug!(%vm_id, %workload_id, "workload stopped");
        }
        Ok(())
    }
}

/// Backend for deployments with no control plane attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

#[async_trait]
impl ComputeBackend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth::Unavailable("no compute backend configured".to_string())
    }

    async fn launch_workload(&self, _vm_id: &str, _workload_id: &str) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("no compute backend configured".to_string()))
    }

    async fn stop_workload(&self, _vm_id: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Backend for the configured `[backend] kind`.
pub fn build_backend(kind: BackendKind) -> Arc<dyn ComputeBackend> {
    match kind {
        BackendKind::Simulated => Arc::new(SimulatedBackend::new()),
        BackendKind::Noop => Arc::new(NoopBackend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_tracks_workloads() {
        let backend = SimulatedBackend::new();
        backend.launch_workload("vm-1", "game-42").await.unwrap();
        assert_eq!(backend.running_workload("vm-1").await.as_deref(), Some("game-42"));

        backend.stop_workload("vm-1").await.unwrap();
        assert!(backend.running_workload("vm-1").await.is_none());
        // Idle stop is fine.
        backend.stop_workload("vm-1").await.unwrap();
    }

    #[tokio::test]
    async fn noop_reports_unavailable() {
        let backend = build_backend(BackendKind::Noop);
        assert_eq!(backend.name(), "noop");
        assert!(!backend.health().await.is_healthy());
        assert!(backend.launch_workload("vm-1", "w").await.is_err());
        assert!(backend.stop_workload("vm-1").await.is_ok());
    }
}

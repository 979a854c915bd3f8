//! The orchestrator handle and its builder.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vmfleet_core::{ErrorCode, FleetConfig, VmStatus, VmTemplate, epoch_millis};
use vmfleet_events::{EventBus, EventEnvelope};
use vmfleet_health::{Assessment, BoxFuture, HealthMonitor, UnhealthyCallback};
use vmfleet_lifecycle::{
    BackendHealth, ComputeBackend, HeartbeatAck, LifecycleEngine, LifecycleError, LifecycleResult,
    Provisioner, RetryContext, RetryPolicy, SimulatedProvisioner, build_backend,
};
use vmfleet_metrics::{MetricsAggregator, aggregate, render_prometheus};
use vmfleet_placement::{RegionResolver, RegionTable, VmMatch};
use vmfleet_state::{
    OrchestratorMetrics, RegionCapacity, SessionAssignment, SessionRecord, StateResult, StateStore,
    StatusTransition, VmCapacity, VmRecord,
};

pub struct OrchestratorBuilder {
    config: FleetConfig,
    store: StateStore,
    events: Option<EventBus>,
    provisioner: Option<Arc<dyn Provisioner>>,
    backend: Option<Arc<dyn ComputeBackend>>,
}

impl OrchestratorBuilder {
    /// Publish on an existing bus instead of a fresh one.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the timer-driven provisioner built from `[provisioning]`.
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Replace the backend selected by `[backend] kind`.
    pub fn backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Seed the template catalog and assemble the orchestrator.
    pub fn build(self) -> StateResult<Orchestrator> {
        let seeded = self.store.seed_templates(&self.config.templates)?;
        info!(templates = seeded, "template catalog seeded");

        let events = self.events.unwrap_or_default();
        let provisioner: Arc<dyn Provisioner> = match self.provisioner {
            Some(provisioner) => provisioner,
            None => Arc::new(SimulatedProvisioner::from_config(&self.config.provisioning)),
        };
        let backend = match self.backend {
            Some(backend) => backend,
            None => build_backend(self.config.backend.kind),
        };
        info!(backend = backend.name(), "compute backend selected");

        let engine = LifecycleEngine::new(
            self.store.clone(),
            events.clone(),
            provisioner,
            backend,
            RetryPolicy::from(&self.config.retry),
        );
        let resolver = RegionResolver::new(self.store.clone(), RegionTable::new(self.config.regions.clone()));

        Ok(Orchestrator {
            config: Arc::new(self.config),
            store: self.store,
            events,
            engine,
            resolver,
        })
    }
}

/// Cloneable handle over the fleet. Clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) config: Arc<FleetConfig>,
    pub(crate) store: StateStore,
    pub(crate) events: EventBus,
    pub(crate) engine: LifecycleEngine,
    pub(crate) resolver: RegionResolver,
}

impl Orchestrator {
    /// Start building an orchestrator over `store`.
    pub fn builder(config: FleetConfig, store: StateStore) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store,
            events: None,
            provisioner: None,
            backend: None,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    pub fn regions(&self) -> &RegionTable {
        self.resolver.regions()
    }

    /// Receive lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    // ── Templates ──────────────────────────────────────────────────

    /// Catalog templates, in configured order; templates added at
    /// runtime follow, by id.
    pub fn list_templates(&self) -> LifecycleResult<Vec<VmTemplate>> {
        let mut templates = self.store.list_templates()?;
        let position = |id: &str| {
            self.config
                .templates
                .iter()
                .position(|t| t.id == id)
                .unwrap_or(usize::MAX)
        };
        templates.sort_by(|a, b| position(&a.id).cmp(&position(&b.id)).then_with(|| a.id.cmp(&b.id)));
        Ok(templates)
    }

    /// Fetch a template or fail with `TemplateNotFound`.
    pub fn get_template(&self, template_id: &str) -> LifecycleResult<VmTemplate> {
        self.store
            .get_template(template_id)?
            .ok_or_else(|| LifecycleError::TemplateNotFound(template_id.to_string()))
    }

    /// Administrative insert-or-replace of a catalog row.
    pub fn upsert_template(&self, template: &VmTemplate) -> LifecycleResult<()> {
        if template.id.trim().is_empty() {
            return Err(LifecycleError::Validation("template id is required".into()));
        }
        if template.max_concurrent_sessions == 0 {
            return Err(LifecycleError::Validation(format!(
                "template {} must allow at least one session",
                template.id
            )));
        }
        self.store.put_template(template)?;
        info!(template_id = %template.id, "template upserted");
        Ok(())
    }

    // ── VMs ────────────────────────────────────────────────────────

    /// Create a VM from a template; it provisions in the background.
    pub async fn create_vm(&self, template_id: &str, region: &str) -> LifecycleResult<VmRecord> {
        self.engine.create_vm(template_id, region).await
    }

    /// Fetch a VM or fail with `VmNotFound`.
    pub fn get_vm(&self, vm_id: &str) -> LifecycleResult<VmRecord> {
        self.engine.get_vm(vm_id)
    }

    /// Every VM row, terminated ones included.
    pub fn list_vms(&self) -> LifecycleResult<Vec<VmRecord>> {
        Ok(self.store.list_vms()?)
    }

    /// VMs in one region.
    pub fn list_vms_by_region(&self, region: &str) -> LifecycleResult<Vec<VmRecord>> {
        Ok(self.store.list_vms_by_region(region)?)
    }

    /// VMs currently in `status`.
    pub fn list_vms_by_status(&self, status: VmStatus) -> LifecycleResult<Vec<VmRecord>> {
        Ok(self.store.list_vms_by_status(status)?)
    }

    /// Mark a provisioning or booting VM ready.
    pub async fn mark_vm_ready(&self, vm_id: &str) -> LifecycleResult<VmRecord> {
        self.engine.mark_ready(vm_id).await
    }

    /// Stop placing new sessions on a VM.
    pub async fn mark_vm_draining(&self, vm_id: &str) -> LifecycleResult<VmRecord> {
        self.engine.mark_draining(vm_id).await
    }

    /// Fail a VM; retryable bring-up failures are retried.
    pub async fn handle_vm_error(&self, vm_id: &str, code: ErrorCode, message: &str) -> LifecycleResult<VmRecord> {
        self.engine.handle_vm_error(vm_id, code, message).await
    }

    /// Force-terminate a VM, releasing its sessions.
    pub async fn terminate_vm(&self, vm_id: &str, reason: Option<&str>) -> LifecycleResult<VmRecord> {
        self.engine.terminate_vm(vm_id, reason).await
    }

    /// Record a heartbeat from a VM agent.
    pub async fn heartbeat(
        &self,
        vm_id: &str,
        session_id: Option<&str>,
        health_status: Option<&str>,
    ) -> LifecycleResult<HeartbeatAck> {
        self.engine.heartbeat(vm_id, session_id, health_status).await
    }

    /// Status history of a VM, oldest first.
    pub fn get_vm_transitions(&self, vm_id: &str) -> LifecycleResult<Vec<StatusTransition>> {
        self.engine.transitions(vm_id)
    }

    /// Retry bookkeeping for a VM that is retrying.
    pub async fn get_retry_context(&self, vm_id: &str) -> Option<RetryContext> {
        self.engine.retry_context(vm_id).await
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Bind a session to a free slot on a VM.
    pub async fn assign_session_to_vm(&self, vm_id: &str, session_id: &str) -> LifecycleResult<VmRecord> {
        self.engine.assign_session(vm_id, session_id).await
    }

    /// Free the slot a session holds on a VM.
    pub async fn release_session_from_vm(&self, vm_id: &str, session_id: &str) -> LifecycleResult<VmRecord> {
        self.engine.release_session(vm_id, session_id).await
    }

    /// Create the session record before it is placed.
    pub async fn register_session(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        game_id: Option<&str>,
    ) -> LifecycleResult<SessionRecord> {
        self.engine.register_session(session_id, user_id, game_id).await
    }

    /// Release whatever VM the session is bound to.
    pub async fn end_session(&self, session_id: &str) -> LifecycleResult<Option<VmRecord>> {
        self.engine.end_session(session_id).await
    }

    /// Sessions bound to a VM.
    pub fn get_vm_sessions(&self, vm_id: &str) -> LifecycleResult<Vec<SessionAssignment>> {
        self.engine.vm_sessions(vm_id)
    }

    /// Slot usage of a VM.
    pub fn get_vm_capacity(&self, vm_id: &str) -> LifecycleResult<VmCapacity> {
        self.engine.vm_capacity(vm_id)
    }

    /// Whether a VM takes sessions and has `count` free slots.
    pub fn can_vm_accept_sessions(&self, vm_id: &str, count: u32) -> LifecycleResult<bool> {
        self.engine.can_vm_accept_sessions(vm_id, count)
    }

    // ── Placement ──────────────────────────────────────────────────

    /// A ready VM in `region` or one of its fallbacks.
    pub fn find_vm_with_fallback(&self, region: &str, sessions: u32) -> LifecycleResult<Option<VmMatch>> {
        Ok(self.resolver.find_vm_with_fallback(region, sessions)?)
    }

    /// Capacity snapshot for one region.
    pub fn get_region_capacity(&self, region: &str) -> LifecycleResult<RegionCapacity> {
        Ok(self.resolver.region_capacity(region)?)
    }

    /// Capacity snapshots for every configured region.
    pub fn get_all_region_capacities(&self) -> LifecycleResult<Vec<RegionCapacity>> {
        Ok(self.resolver.all_region_capacities()?)
    }

    /// VMs in `region` with room for `sessions`, roomiest first.
    pub fn available_vms_for_sessions(&self, region: &str, sessions: u32) -> LifecycleResult<Vec<VmRecord>> {
        Ok(self.resolver.available_vms_for_sessions(region, sessions)?)
    }

    // ── Backend ────────────────────────────────────────────────────

    /// Start a workload on a VM that is serving sessions.
    pub async fn launch_workload(&self, vm_id: &str, workload_id: &str) -> LifecycleResult<()> {
        self.engine.launch_workload(vm_id, workload_id).await
    }

    /// Stop the workload on a VM.
    pub async fn stop_workload(&self, vm_id: &str) -> LifecycleResult<()> {
        self.engine.stop_workload(vm_id).await
    }

    /// Health report from the compute backend.
    pub async fn get_backend_health(&self) -> BackendHealth {
        self.engine.backend_health().await
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Live aggregate over the current store contents.
    pub fn get_orchestrator_metrics(&self) -> LifecycleResult<OrchestratorMetrics> {
        let vms = self.store.list_vms()?;
        Ok(aggregate(&vms, self.resolver.regions(), epoch_millis()))
    }

    /// Persisted snapshots, newest first.
    pub fn metrics_history(&self, limit: usize) -> LifecycleResult<Vec<OrchestratorMetrics>> {
        Ok(self.store.list_metrics(limit)?)
    }

    /// Live metrics as Prometheus text.
    pub fn render_metrics(&self) -> LifecycleResult<String> {
        Ok(render_prometheus(&self.get_orchestrator_metrics()?))
    }

    // ── Background loops ───────────────────────────────────────────

    /// Health monitor whose unhealthy VMs are failed with
    /// `HEARTBEAT_TIMEOUT`.
    pub fn health_monitor(&self) -> HealthMonitor {
        let engine = self.engine.clone();
        let callback: UnhealthyCallback = Arc::new(move |vm_id: String, assessment: Assessment| -> BoxFuture {
            let engine = engine.clone();
            Box::pin(async move {
                let message = format!("heartbeat timeout: {assessment}");
                if let Err(e) = engine.handle_vm_error(&vm_id, ErrorCode::HeartbeatTimeout, &message).await {
                    // The VM may have moved on since the sweep read it.
                    debug!(%vm_id, error = %e, "unhealthy VM not failed");
                }
            })
        });
        HealthMonitor::new(self.store.clone(), &self.config.health).with_callback(callback)
    }

    /// Aggregator that persists snapshots and raises low-capacity events.
    pub fn metrics_aggregator(&self) -> MetricsAggregator {
        MetricsAggregator::new(
            self.store.clone(),
            self.resolver.regions().clone(),
            self.events.clone(),
            &self.config.metrics,
        )
    }

    /// Spawn the health, metrics and retry-eviction loops. Each stops
    /// when `shutdown` flips.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let health = self.health_monitor();
        let metrics = self.metrics_aggregator();
        let engine = self.engine.clone();
        let ttl = self.config.retry.context_ttl;

        let handles = vec![
            tokio::spawn(health.run(shutdown.clone())),
            tokio::spawn(metrics.run(shutdown.clone())),
            tokio::spawn(evict_retries(engine, ttl, shutdown)),
        ];
        info!(loops = handles.len(), "background loops started");
        handles
    }

    /// Abort every pending provisioning or retry task.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        info!("orchestrator stopped");
    }
}

async fn evict_retries(engine: LifecycleEngine, ttl: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ttl) => {
                let evicted = engine.evict_stale_retries().await;
                if evicted > 0 {
                    warn!(evicted, "dropped idle retry contexts");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

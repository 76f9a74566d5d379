//! The ALB ingress controller
//!
//! Startup follows `ControllerArgs` (unconfigured) → [`ControllerConfig`]
//! (validated) → [`RunningController`]: the controller performs one provider
//! resync, then spawns the drift and watchdog loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use super::config::ControllerConfig;
use super::convergence::{ConvergenceEngine, PassReport};
use super::export::{snapshot, RegistrySnapshot};
use super::health::{HealthMonitor, HealthReport};
use super::scheduler;
use super::state::{Registry, SharedState, SyncState};
use super::traits::{EventRecorder, EventSource, ResourceReconciler};
use crate::error::Result;
use crate::ingress::builder::resource_id;
use crate::ingress::{is_managed_class, AnnotationInterpreter, ResourceId};

/// Implementations injected once at construction
pub struct Collaborators {
    pub source: Arc<dyn EventSource>,
    pub reconciler: Arc<dyn ResourceReconciler>,
    pub interpreter: Arc<dyn AnnotationInterpreter>,
    pub events: Arc<dyn EventRecorder>,
    pub health: HealthMonitor,
}

pub struct AlbController {
    config: Arc<ControllerConfig>,
    engine: ConvergenceEngine,
    health: HealthMonitor,
    state: SharedState,
    ready: AtomicBool,
    /// Number of the last committed convergence pass
    committed: watch::Sender<u64>,
}

impl AlbController {
    pub fn new(config: ControllerConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let engine = ConvergenceEngine::new(
            Arc::clone(&config),
            collaborators.source,
            collaborators.reconciler,
            collaborators.interpreter,
            collaborators.events,
        );
        Self {
            config,
            engine,
            health: collaborators.health,
            state: SharedState::new(SyncState::default()),
            ready: AtomicBool::new(false),
            committed: watch::Sender::new(0),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Event-driven and forced convergence entry point
    pub async fn on_update(&self) -> PassReport {
        let mut state = self.state.write().await;
        let report = self.engine.converge(&mut state).await;
        self.committed.send_replace(state.passes);
        report
    }

    /// Notified after every committed convergence pass, whatever triggered it
    pub fn subscribe_passes(&self) -> watch::Receiver<u64> {
        self.committed.subscribe()
    }

    /// Replace the registry with the provider's inventory
    pub async fn sync_with_provider(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        self.engine.resync(&mut state).await
    }

    pub async fn export(&self) -> RegistrySnapshot {
        let state = self.state.read().await;
        snapshot(&state)
    }

    /// Run every health probe under the shared lock
    #[instrument(skip(self))]
    pub async fn collect_checks(&self) -> HealthReport {
        let _state = self.state.read().await;
        self.health.run().await
    }

    /// Load balancer hostnames the ingress status should carry
    pub async fn ingress_status(&self, ingress: &Ingress) -> Vec<IngressLoadBalancerIngress> {
        let state = self.state.read().await;
        self.status_for(&state.registry, ingress)
    }

    /// Managed ingresses whose `status.loadBalancer.ingress` differs from the
    /// registry, with the value each should carry
    pub async fn pending_statuses(
        &self,
        ingresses: &[Arc<Ingress>],
    ) -> Vec<(ResourceId, Vec<IngressLoadBalancerIngress>)> {
        let state = self.state.read().await;
        ingresses
            .iter()
            .filter(|ingress| is_managed_class(ingress, &self.config.ingress_class))
            .filter_map(|ingress| {
                let wanted = self.status_for(&state.registry, ingress);
                let current = ingress
                    .status
                    .as_ref()
                    .and_then(|s| s.load_balancer.as_ref())
                    .and_then(|lb| lb.ingress.clone())
                    .unwrap_or_default();
                (current != wanted).then(|| (resource_id(ingress), wanted))
            })
            .collect()
    }

    fn status_for(&self, registry: &Registry, ingress: &Ingress) -> Vec<IngressLoadBalancerIngress> {
        self.engine
            .hostnames(registry, &resource_id(ingress))
            .into_iter()
            .map(|hostname| IngressLoadBalancerIngress {
                hostname: Some(hostname),
                ..Default::default()
            })
            .collect()
    }

    /// Completion time of the last convergence pass
    pub async fn last_update(&self) -> Option<Instant> {
        self.state.read().await.last_update
    }

    /// True once the initial provider resync has run
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Perform the initial resync and start the timed loops
    pub async fn start(self: Arc<Self>) -> RunningController {
        match self.sync_with_provider().await {
            Ok(count) => info!("Initial sync found {} load balancer(s)", count),
            Err(e) => warn!("Initial provider sync failed, starting with an empty registry: {}", e),
        }
        self.ready.store(true, Ordering::Release);

        let tasks = vec![
            tokio::spawn(scheduler::run_drift_loop(Arc::clone(&self))),
            tokio::spawn(scheduler::run_watchdog(Arc::clone(&self))),
        ];
        info!(
            "Controller running (drift resync every {:?}, watchdog every {:?})",
            self.config.sync_interval,
            scheduler::WATCHDOG_TICK
        );

        RunningController {
            controller: self,
            tasks,
        }
    }
}

/// A started controller and its background loops
pub struct RunningController {
    controller: Arc<AlbController>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningController {
    pub fn controller(&self) -> &Arc<AlbController> {
        &self.controller
    }

    /// Abort the drift and watchdog loops
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!("Controller loops stopped");
    }
}

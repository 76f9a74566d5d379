//! Convergence engine
//!
//! One pass computes the desired resources from the current declarations,
//! appends the resources whose declarations vanished (with desired state
//! cleared), reconciles every entry concurrently, waits for all of them and
//! commits the registry filtered down to live load balancers.
//!
//! Callers hold the exclusive [`SyncState`] guard for the whole pass.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::config::ControllerConfig;
use super::metrics;
use super::retry::{Dispatch, FailureOutcome};
use super::state::{Registry, SyncState};
use super::traits::{DiscoveryScope, EventRecorder, EventSource, EventType, ResourceReconciler};
use crate::error::{Error, Result};
use crate::ingress::builder::resource_id;
use crate::ingress::{
    is_managed_class, node_instance_ids, AnnotationInterpreter, BuildContext, ManagedResource,
    ResourceId,
};

/// Desired resources computed from one declaration snapshot
#[derive(Debug, Default)]
pub struct DesiredSet {
    pub resources: Registry,
    /// Declared resources whose desired state could not be computed this
    /// pass; they keep their prior entry and are not dispatched
    pub held: BTreeSet<ResourceId>,
    pub problems: Vec<(ResourceId, Error)>,
}

/// Summary of one convergence pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub declared: usize,
    /// Resources whose declaration disappeared since the previous pass
    pub removed: Vec<ResourceId>,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub held: usize,
    pub deferred: usize,
    pub parked: usize,
    /// Entries dropped after the join because they have no live handle
    pub purged: usize,
    pub tracked: usize,
}

pub struct ConvergenceEngine {
    config: Arc<ControllerConfig>,
    source: Arc<dyn EventSource>,
    reconciler: Arc<dyn ResourceReconciler>,
    interpreter: Arc<dyn AnnotationInterpreter>,
    events: Arc<dyn EventRecorder>,
}

impl ConvergenceEngine {
    pub fn new(
        config: Arc<ControllerConfig>,
        source: Arc<dyn EventSource>,
        reconciler: Arc<dyn ResourceReconciler>,
        interpreter: Arc<dyn AnnotationInterpreter>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            config,
            source,
            reconciler,
            interpreter,
            events,
        }
    }

    /// Build the desired resource set, carrying handles over from `prior`
    pub fn build_desired(&self, prior: &Registry) -> DesiredSet {
        let targets = node_instance_ids(&self.source.nodes());
        let ctx = BuildContext {
            cluster_name: &self.config.cluster_name,
            prefix: &self.config.alb_name_prefix,
            source: self.source.as_ref(),
            interpreter: self.interpreter.as_ref(),
        };

        let mut desired = DesiredSet::default();
        for ingress in self.source.ingresses() {
            if !is_managed_class(&ingress, &self.config.ingress_class) {
                continue;
            }
            // Ingresses being deleted are treated as gone
            if ingress.metadata.deletion_timestamp.is_some() {
                continue;
            }

            let id = resource_id(&ingress);
            let previous = prior.get(&id).cloned();
            match ctx.desired_spec(&ingress, &targets) {
                Ok(spec) => {
                    let mut resource = previous.unwrap_or_else(|| ManagedResource::new(id));
                    resource.desired = Some(spec);
                    desired.resources.insert(resource);
                }
                Err(e) => {
                    desired
                        .resources
                        .insert(previous.unwrap_or_else(|| ManagedResource::new(id.clone())));
                    desired.held.insert(id.clone());
                    desired.problems.push((id, e));
                }
            }
        }
        desired
    }

    /// Run one full convergence pass against `state`
    #[instrument(skip_all, fields(pass = state.passes + 1))]
    pub async fn converge(&self, state: &mut SyncState) -> PassReport {
        let started = Instant::now();
        metrics::inc_on_update();

        let desired = self.build_desired(&state.registry);
        for (id, e) in &desired.problems {
            warn!("Unable to compute desired state for {}: {}", id, e);
            metrics::inc_reconcile_error(e.kind());
            let reason = match e {
                Error::LookupError(_) => "LookupFailed",
                _ => "InvalidIngress",
            };
            self.events
                .publish(id, EventType::Warning, reason, &e.to_string())
                .await;
        }

        let declared: BTreeSet<ResourceId> = desired.resources.ids().cloned().collect();
        let removed = state.registry.removed(&desired.resources);

        let mut report = PassReport {
            declared: declared.len(),
            removed: removed.iter().map(|r| r.id.clone()).collect(),
            held: desired.held.len(),
            ..PassReport::default()
        };

        let mut working = desired.resources;
        working.extend(removed);
        let mut counts = working.namespace_counts();
        debug!("Ingress count: {}", working.len());
        state.registry = working;

        let now = Instant::now();
        let policy = self.config.retry;
        let mut batch = Vec::new();
        for resource in state.registry.iter() {
            if desired.held.contains(&resource.id) {
                continue;
            }
            match state.retries.check(resource, &policy, now) {
                Dispatch::Run => batch.push(resource.clone()),
                Dispatch::Backoff { remaining } => {
                    debug!("Deferring {} for {:?} after failures", resource.id, remaining);
                    report.deferred += 1;
                }
                Dispatch::Parked { failures } => {
                    debug!("Skipping parked {} ({} failures)", resource.id, failures);
                    report.parked += 1;
                }
            }
        }
        report.dispatched = batch.len();

        for (id, outcome) in self.dispatch(batch).await {
            match outcome {
                Ok(updated) => {
                    state.retries.record_success(&id);
                    state.registry.insert(updated);
                    report.succeeded += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    self.record_failure(state, &id, e, now).await;
                }
            }
        }

        for dropped in state.registry.retain_live() {
            if let Some(count) = counts.get_mut(dropped.namespace()) {
                *count = count.saturating_sub(1);
            }
            report.purged += 1;
        }
        counts.retain(|_, count| *count > 0);
        debug_assert_eq!(counts, state.registry.namespace_counts());

        state
            .retries
            .retain(|id| declared.contains(id) || state.registry.contains(id));
        metrics::set_parked_resources(state.retries.parked(policy.max_failures));

        metrics::set_managed_ingresses(&state.namespace_counts, &counts);
        state.namespace_counts = counts;
        state.last_update = Some(Instant::now());
        state.last_update_at = Some(chrono::Utc::now());
        state.passes += 1;
        report.tracked = state.registry.len();

        let elapsed = started.elapsed();
        metrics::observe_pass_duration_seconds("converge", elapsed.as_secs_f64());
        info!(
            "Convergence pass complete in {:?}: {} declared, {} removed, {} dispatched, {} failed, {} tracked",
            elapsed,
            report.declared,
            report.removed.len(),
            report.dispatched,
            report.failed,
            report.tracked
        );
        report
    }

    async fn record_failure(&self, state: &mut SyncState, id: &ResourceId, e: Error, now: Instant) {
        metrics::inc_reconcile_error(e.kind());
        // The entry still holds its pre-pass state
        let Some(resource) = state.registry.get(id) else {
            return;
        };

        match state
            .retries
            .record_failure(resource, e.to_string(), e.is_retriable(), &self.config.retry, now)
        {
            FailureOutcome::Retrying { failures, delay } => {
                warn!(
                    "Reconcile of {} failed (attempt {}), retrying in {:?}: {}",
                    id, failures, delay, e
                );
                self.events
                    .publish(id, EventType::Warning, "ReconcileFailed", &e.to_string())
                    .await;
            }
            FailureOutcome::Parked { failures } => {
                error!(
                    "Reconcile of {} failed {} consecutive times; parking until its spec changes: {}",
                    id, failures, e
                );
                self.events
                    .publish(
                        id,
                        EventType::Warning,
                        "ReconcileParked",
                        &format!("Giving up after {failures} consecutive failures: {e}"),
                    )
                    .await;
            }
        }
    }

    /// Reconcile every resource in its own task and wait for all of them.
    ///
    /// Each task works on its own copy of the resource; a failure, timeout
    /// or panic only affects that resource's outcome.
    async fn dispatch(
        &self,
        batch: Vec<ManagedResource>,
    ) -> Vec<(ResourceId, Result<ManagedResource>)> {
        let timeout = self.config.reconcile_timeout;
        let (ids, handles): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|resource| {
                let id = resource.id.clone();
                let task = reconcile_one(
                    Arc::clone(&self.reconciler),
                    Arc::clone(&self.events),
                    resource,
                    timeout,
                );
                (id, tokio::spawn(task))
            })
            .unzip();

        let joined = futures::future::join_all(handles).await;

        ids.into_iter()
            .zip(joined)
            .map(|(id, joined)| {
                let outcome = joined.unwrap_or_else(|e| {
                    Err(Error::TaskAborted {
                        id: id.clone(),
                        message: e.to_string(),
                    })
                });
                (id, outcome)
            })
            .collect()
    }

    /// Rebuild the registry from the provider's inventory.
    ///
    /// On error the registry is left untouched.
    #[instrument(skip_all)]
    pub async fn resync(&self, state: &mut SyncState) -> Result<usize> {
        let started = Instant::now();
        let scope = DiscoveryScope {
            cluster_name: self.config.cluster_name.clone(),
            prefix: self.config.alb_name_prefix.clone(),
        };
        let discovered = self.reconciler.discover(&scope).await?;

        let registry: Registry = discovered
            .into_iter()
            .filter(ManagedResource::is_live)
            .map(ManagedResource::into_removal)
            .collect();
        let counts = registry.namespace_counts();

        metrics::set_managed_ingresses(&state.namespace_counts, &counts);
        state.registry = registry;
        state.namespace_counts = counts;
        state.retries.clear();
        metrics::set_parked_resources(0);
        state.last_resync_at = Some(chrono::Utc::now());

        metrics::observe_pass_duration_seconds("resync", started.elapsed().as_secs_f64());
        info!(
            "Assembled {} load balancer(s) from provider inventory",
            state.registry.len()
        );
        Ok(state.registry.len())
    }

    /// Hostnames for `id`, empty when it is unknown or has none
    pub fn hostnames(&self, registry: &Registry, id: &ResourceId) -> Vec<String> {
        registry
            .get(id)
            .and_then(|resource| self.reconciler.hostnames(resource).ok())
            .unwrap_or_default()
    }
}

async fn reconcile_one(
    reconciler: Arc<dyn ResourceReconciler>,
    events: Arc<dyn EventRecorder>,
    mut resource: ManagedResource,
    timeout: Duration,
) -> Result<ManagedResource> {
    let id = resource.id.clone();
    let result =
        tokio::time::timeout(timeout, reconciler.reconcile(&mut resource, events.as_ref())).await;
    match result {
        Ok(Ok(())) => Ok(resource),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::ReconcileTimeout(id)),
    }
}

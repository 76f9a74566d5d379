//! Collaborator contracts consumed by the controller
//!
//! The controller is constructed once with one implementation of each trait
//! and holds them as immutable shared references.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service};
use k8s_openapi::api::networking::v1::Ingress;

use crate::error::Result;
use crate::ingress::{ManagedResource, ResourceId};

/// Read-only view of the cluster objects the controller derives desired
/// state from.
pub trait EventSource: Send + Sync {
    /// Current ingress declarations
    fn ingresses(&self) -> Vec<Arc<Ingress>>;

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>>;

    fn nodes(&self) -> Vec<Arc<Node>>;

    fn config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>>;
}

/// Kubernetes event severity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// Publishes events against the ingress behind a managed resource.
///
/// Publishing is best-effort: implementations log their own failures.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, id: &ResourceId, type_: EventType, reason: &str, message: &str);
}

/// Which provider resources belong to this controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryScope {
    pub cluster_name: String,
    pub prefix: String,
}

/// Creates, updates and deletes the cloud resources behind one
/// [`ManagedResource`].
#[async_trait]
pub trait ResourceReconciler: Send + Sync {
    /// Drive the provider towards `resource.desired`.
    ///
    /// Must be idempotent. A cleared desired state means delete; on success
    /// the resource's handle reflects the provider (and reports deleted once
    /// teardown is confirmed).
    async fn reconcile(&self, resource: &mut ManagedResource, events: &dyn EventRecorder)
        -> Result<()>;

    /// Every load balancer the provider currently holds for `scope`, with
    /// handles populated and desired state cleared.
    async fn discover(&self, scope: &DiscoveryScope) -> Result<Vec<ManagedResource>>;

    /// Hostnames the ingress status should report for this resource
    fn hostnames(&self, resource: &ManagedResource) -> Result<Vec<String>> {
        Ok(resource
            .external_handle()
            .filter(|h| !h.is_deleted())
            .and_then(|h| h.dns_name.clone())
            .into_iter()
            .collect())
    }
}

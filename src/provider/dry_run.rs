//! In-memory load balancer provider
//!
//! Keeps a simulated inventory keyed by load balancer name. Every change is
//! logged as the plan a real backend would execute.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::controller::{DiscoveryScope, EventRecorder, EventType, ResourceReconciler};
use crate::error::{Error, Result};
use crate::ingress::builder::{CLUSTER_TAG_PREFIX, INGRESS_NAME_TAG, NAMESPACE_TAG};
use crate::ingress::{DesiredSpec, ExternalHandle, ManagedResource, ResourceId, Scheme};

const DEFAULT_ACCOUNT: &str = "000000000000";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedLoadBalancer {
    pub arn: String,
    pub dns_name: String,
    pub spec: DesiredSpec,
}

impl ProvisionedLoadBalancer {
    fn handle(&self) -> ExternalHandle {
        ExternalHandle {
            arn: self.arn.clone(),
            dns_name: Some(self.dns_name.clone()),
            deleted: false,
        }
    }

    /// Ingress this load balancer was created for, read back from its tags
    fn owner(&self) -> Option<ResourceId> {
        let namespace = self.spec.tags.get(NAMESPACE_TAG)?;
        let name = self.spec.tags.get(INGRESS_NAME_TAG)?;
        Some(ResourceId::new(namespace.clone(), name.clone()))
    }
}

pub struct DryRunProvider {
    region: String,
    account: String,
    inventory: Mutex<BTreeMap<String, ProvisionedLoadBalancer>>,
}

impl DryRunProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account: DEFAULT_ACCOUNT.to_string(),
            inventory: Mutex::new(BTreeMap::new()),
        }
    }

    fn provision(&self, spec: &DesiredSpec) -> ProvisionedLoadBalancer {
        let name = &spec.load_balancer_name;
        let suffix = &hex::encode(Sha256::digest(name.as_bytes()))[..16];
        let dns_name = match spec.scheme {
            Scheme::Internal => format!("internal-{name}-{suffix}.{}.elb.amazonaws.com", self.region),
            Scheme::InternetFacing => format!("{name}-{suffix}.{}.elb.amazonaws.com", self.region),
        };
        ProvisionedLoadBalancer {
            arn: format!(
                "arn:aws:elasticloadbalancing:{}:{}:loadbalancer/app/{name}/{suffix}",
                self.region, self.account
            ),
            dns_name,
            spec: spec.clone(),
        }
    }

    /// Create a load balancer outside of any reconciliation, as an operator
    /// using the console would
    pub fn insert_external(&self, spec: DesiredSpec) -> ExternalHandle {
        let lb = self.provision(&spec);
        let handle = lb.handle();
        self.inventory.lock().insert(spec.load_balancer_name, lb);
        handle
    }

    /// Delete a load balancer outside of any reconciliation
    pub fn remove_external(&self, load_balancer_name: &str) -> Option<ProvisionedLoadBalancer> {
        self.inventory.lock().remove(load_balancer_name)
    }

    pub fn inventory(&self) -> Vec<ProvisionedLoadBalancer> {
        self.inventory.lock().values().cloned().collect()
    }

    pub fn get(&self, load_balancer_name: &str) -> Option<ProvisionedLoadBalancer> {
        self.inventory.lock().get(load_balancer_name).cloned()
    }

    fn find_by_arn(&self, arn: &str) -> Option<ProvisionedLoadBalancer> {
        self.inventory.lock().values().find(|lb| lb.arn == arn).cloned()
    }
}

#[async_trait]
impl ResourceReconciler for DryRunProvider {
    async fn reconcile(
        &self,
        resource: &mut ManagedResource,
        events: &dyn EventRecorder,
    ) -> Result<()> {
        let id = resource.id.clone();
        let existing = resource
            .external_handle()
            .filter(|h| !h.is_deleted())
            .and_then(|h| self.find_by_arn(&h.arn));

        match (resource.desired.as_ref(), existing) {
            (Some(desired), Some(current)) if current.spec == *desired => {
                debug!("{}: {} is up to date", id, desired.load_balancer_name);
                resource.handle = Some(current.handle());
            }
            (Some(desired), Some(current)) => {
                if current.spec.load_balancer_name != desired.load_balancer_name {
                    return Err(Error::ReconcileError {
                        id,
                        message: format!(
                            "load balancer {} cannot be renamed to {}",
                            current.spec.load_balancer_name, desired.load_balancer_name
                        ),
                    });
                }
                info!(
                    "{}: modifying {} ({} listener(s), {} target group(s), {} target(s))",
                    id,
                    desired.load_balancer_name,
                    desired.listeners.len(),
                    desired.target_groups.len(),
                    desired.targets.len()
                );
                let updated = ProvisionedLoadBalancer {
                    spec: desired.clone(),
                    ..current
                };
                resource.handle = Some(updated.handle());
                self.inventory
                    .lock()
                    .insert(desired.load_balancer_name.clone(), updated);
                events
                    .publish(
                        &id,
                        EventType::Normal,
                        "MODIFY",
                        &format!("{} modified", desired.load_balancer_name),
                    )
                    .await;
            }
            (Some(desired), None) => {
                let lb = self.provision(desired);
                info!(
                    "{}: creating {} ({}) as {}",
                    id,
                    desired.load_balancer_name,
                    desired.scheme.as_str(),
                    lb.arn
                );
                resource.handle = Some(lb.handle());
                self.inventory
                    .lock()
                    .insert(desired.load_balancer_name.clone(), lb);
                events
                    .publish(
                        &id,
                        EventType::Normal,
                        "CREATE",
                        &format!("{} created", desired.load_balancer_name),
                    )
                    .await;
            }
            (None, Some(current)) => {
                info!("{}: deleting {}", id, current.spec.load_balancer_name);
                self.inventory.lock().remove(&current.spec.load_balancer_name);
                resource.handle = Some(ExternalHandle {
                    deleted: true,
                    ..current.handle()
                });
                events
                    .publish(
                        &id,
                        EventType::Normal,
                        "DELETE",
                        &format!("{} deleted", current.spec.load_balancer_name),
                    )
                    .await;
            }
            (None, None) => {
                // Nothing provisioned, or it is already gone
                if let Some(handle) = resource.handle.as_mut() {
                    handle.deleted = true;
                }
            }
        }
        Ok(())
    }

    async fn discover(&self, scope: &DiscoveryScope) -> Result<Vec<ManagedResource>> {
        let cluster_tag = format!("{CLUSTER_TAG_PREFIX}{}", scope.cluster_name);
        let name_prefix = format!("{}-", scope.prefix);

        let inventory = self.inventory.lock().clone();
        let mut discovered = Vec::new();
        for lb in inventory.values() {
            if !lb.spec.load_balancer_name.starts_with(&name_prefix)
                || !lb.spec.tags.contains_key(&cluster_tag)
            {
                continue;
            }
            let Some(id) = lb.owner() else {
                warn!(
                    "{} carries the cluster tag but no ingress tags, ignoring",
                    lb.spec.load_balancer_name
                );
                continue;
            };
            discovered.push(ManagedResource {
                id,
                desired: None,
                handle: Some(lb.handle()),
            });
        }
        debug!("Discovered {} load balancer(s)", discovered.len());
        Ok(discovered)
    }
}

//! Managed ingress resources
//!
//! A [`ManagedResource`] is the controller's unit of reconciliation: one
//! Kubernetes Ingress and the application load balancer provisioned for it.

pub mod annotations;
pub mod builder;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use annotations::{
    AnnotationInterpreter, Annotations, DefaultAnnotationInterpreter, SchemeRestriction,
};
pub use builder::{
    is_managed_class, load_balancer_name, node_instance_ids, BuildContext, DEFAULT_INGRESS_CLASS,
};

/// Stable identity of a managed ingress.
///
/// Namespaces and names can never contain `/`, so the `namespace/name` form
/// is collision-free.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Load balancer scheme
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    #[default]
    Internal,
    InternetFacing,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Internal => "internal",
            Scheme::InternetFacing => "internet-facing",
        }
    }
}

/// Listener and target group protocol
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub port: u16,
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_policy: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroupSpec {
    pub name: String,
    pub service_name: String,
    pub service_port: i32,
    pub node_port: i32,
    pub protocol: Protocol,
    pub health_check_path: String,
    pub health_check_port: String,
    pub success_codes: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub priority: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub target_group: String,
}

/// Everything the resource reconciler needs to provision one load balancer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredSpec {
    pub load_balancer_name: String,
    pub scheme: Scheme,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub listeners: Vec<ListenerSpec>,
    pub target_groups: Vec<TargetGroupSpec>,
    pub rules: Vec<RuleSpec>,
    /// Instance ids registered with every target group, sorted
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_acl_id: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Opaque reference to a provisioned load balancer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalHandle {
    pub arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    pub deleted: bool,
}

impl ExternalHandle {
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub id: ResourceId,
    /// `None` signals the reconciler to tear the load balancer down
    pub desired: Option<DesiredSpec>,
    pub handle: Option<ExternalHandle>,
}

impl ManagedResource {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            desired: None,
            handle: None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.id.namespace
    }

    pub fn external_handle(&self) -> Option<&ExternalHandle> {
        self.handle.as_ref()
    }

    /// True while the load balancer exists and has not been torn down
    pub fn is_live(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_deleted())
    }

    /// Clear the desired state so the next reconcile deletes the load balancer
    pub fn into_removal(mut self) -> Self {
        self.desired = None;
        self
    }

    pub fn is_removal(&self) -> bool {
        self.desired.is_none()
    }
}

//! Desired-state construction for a single ingress
//!
//! Resolves backend services to node ports through the cluster snapshot,
//! interprets annotations and derives stable provider-side names.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend, ServiceBackendPort};
use sha2::{Digest, Sha256};

use super::annotations::AnnotationInterpreter;
use super::{DesiredSpec, ListenerSpec, Protocol, ResourceId, RuleSpec, TargetGroupSpec};
use crate::controller::EventSource;
use crate::error::{Error, Result};

/// Class handled when no `--ingress-class` is configured
pub const DEFAULT_INGRESS_CLASS: &str = "alb";

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const MASTER_ROLE_LABEL: &str = "node-role.kubernetes.io/master";
const CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";
const EXCLUDE_BALANCER_LABEL: &str = "alpha.service-controller.kubernetes.io/exclude-balancer";

pub const CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";
pub const NAMESPACE_TAG: &str = "kubernetes.io/namespace";
pub const INGRESS_NAME_TAG: &str = "kubernetes.io/ingress-name";

pub fn resource_id(ingress: &Ingress) -> ResourceId {
    ResourceId::new(
        ingress
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        ingress.metadata.name.clone().unwrap_or_default(),
    )
}

/// Whether this controller is responsible for the ingress.
///
/// With no configured class, unclassed ingresses and the default `alb`
/// class are both handled.
pub fn is_managed_class(ingress: &Ingress, configured: &str) -> bool {
    let class = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION))
        .or_else(|| {
            ingress
                .spec
                .as_ref()
                .and_then(|s| s.ingress_class_name.as_ref())
        });

    match (configured.is_empty(), class) {
        (true, None) => true,
        (true, Some(class)) => class == DEFAULT_INGRESS_CLASS,
        (false, class) => class.map(String::as_str) == Some(configured),
    }
}

/// Instance ids of the nodes that should receive load balancer traffic.
///
/// Control-plane nodes and nodes labelled with the exclude-balancer label
/// are skipped. The result is sorted so that unchanged clusters produce
/// identical target lists.
pub fn node_instance_ids(nodes: &[Arc<Node>]) -> Vec<String> {
    let mut ids: Vec<String> = nodes
        .iter()
        .filter(|node| {
            let Some(labels) = node.metadata.labels.as_ref() else {
                return true;
            };
            if labels.contains_key(MASTER_ROLE_LABEL) || labels.contains_key(CONTROL_PLANE_ROLE_LABEL)
            {
                return false;
            }
            !labels
                .get(EXCLUDE_BALANCER_LABEL)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        })
        .filter_map(|node| {
            node.spec
                .as_ref()
                .and_then(|s| s.provider_id.as_deref())
                .and_then(|id| id.rsplit('/').next())
                .filter(|id| !id.is_empty())
                .map(String::from)
        })
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// `<prefix>-<15 hex chars>`, at most 27 characters
pub fn load_balancer_name(prefix: &str, id: &ResourceId) -> String {
    format!("{}-{}", prefix, &digest(&id.to_string())[..15])
}

/// `<prefix>-<20 hex chars>`, at most 32 characters
pub fn target_group_name(prefix: &str, id: &ResourceId, service: &str, port: i32) -> String {
    format!(
        "{}-{}",
        prefix,
        &digest(&format!("{id}/{service}:{port}"))[..20]
    )
}

pub struct BuildContext<'a> {
    pub cluster_name: &'a str,
    pub prefix: &'a str,
    pub source: &'a dyn EventSource,
    pub interpreter: &'a dyn AnnotationInterpreter,
}

impl BuildContext<'_> {
    /// Compute the desired load balancer for `ingress`.
    ///
    /// Lookup and annotation failures are returned to the caller, which
    /// treats them as per-resource problems for this pass.
    pub fn desired_spec(&self, ingress: &Ingress, targets: &[String]) -> Result<DesiredSpec> {
        let id = resource_id(ingress);
        let annotations = ingress.metadata.annotations.clone().unwrap_or_default();
        let parsed = self.interpreter.parse(&id, &annotations, self.source)?;

        let mut target_groups: Vec<TargetGroupSpec> = Vec::new();
        let mut rules = Vec::new();

        let spec = ingress.spec.as_ref();
        if let Some(backend) = spec.and_then(|s| s.default_backend.as_ref()) {
            let tg = self.target_group(&id, &annotations, backend, &mut target_groups)?;
            rules.push(RuleSpec {
                priority: 0,
                host: None,
                path: None,
                target_group: tg,
            });
        }

        let ingress_rules = spec.and_then(|s| s.rules.as_ref());
        let mut priority = 0;
        for rule in ingress_rules.into_iter().flatten() {
            let Some(http) = rule.http.as_ref() else {
                continue;
            };
            for path in &http.paths {
                let tg = self.target_group(&id, &annotations, &path.backend, &mut target_groups)?;
                priority += 1;
                rules.push(RuleSpec {
                    priority,
                    host: rule.host.clone(),
                    path: path.path.clone(),
                    target_group: tg,
                });
            }
        }

        let listeners = parsed
            .listen_ports
            .iter()
            .map(|(protocol, port)| ListenerSpec {
                port: *port,
                protocol: *protocol,
                certificate_arn: match protocol {
                    Protocol::Https => parsed.certificate_arn.clone(),
                    Protocol::Http => None,
                },
                ssl_policy: match protocol {
                    Protocol::Https => parsed.ssl_policy.clone(),
                    Protocol::Http => None,
                },
            })
            .collect();

        let mut tags = parsed.tags.clone();
        tags.insert(
            format!("{CLUSTER_TAG_PREFIX}{}", self.cluster_name),
            "owned".to_string(),
        );
        tags.insert(NAMESPACE_TAG.to_string(), id.namespace.clone());
        tags.insert(INGRESS_NAME_TAG.to_string(), id.name.clone());

        Ok(DesiredSpec {
            load_balancer_name: load_balancer_name(self.prefix, &id),
            scheme: parsed.scheme,
            subnets: parsed.subnets,
            security_groups: parsed.security_groups,
            listeners,
            target_groups,
            rules,
            targets: targets.to_vec(),
            web_acl_id: parsed.web_acl_id,
            tags,
        })
    }

    /// Resolve one backend to a target group, reusing an existing one for
    /// repeated (service, port) pairs. Returns the target group name.
    fn target_group(
        &self,
        id: &ResourceId,
        ingress_annotations: &BTreeMap<String, String>,
        backend: &IngressBackend,
        target_groups: &mut Vec<TargetGroupSpec>,
    ) -> Result<String> {
        let service_backend = backend.service.as_ref().ok_or_else(|| {
            Error::LookupError(format!("{id} has a backend without a service reference"))
        })?;
        let service_name = service_backend.name.as_str();
        let (service_port, node_port) =
            self.service_node_port(&id.namespace, service_name, service_backend.port.as_ref())?;

        let name = target_group_name(self.prefix, id, service_name, service_port);
        if target_groups.iter().any(|tg| tg.name == name) {
            return Ok(name);
        }

        let mut merged = ingress_annotations.clone();
        if let Some(service_annotations) = self.service_annotations(&id.namespace, service_name)? {
            merged.extend(service_annotations);
        }
        let attributes = self.interpreter.parse(id, &merged, self.source)?;

        target_groups.push(TargetGroupSpec {
            name: name.clone(),
            service_name: service_name.to_string(),
            service_port,
            node_port,
            protocol: attributes.backend_protocol,
            health_check_path: attributes.health_check_path,
            health_check_port: attributes.health_check_port,
            success_codes: attributes.success_codes,
        });
        Ok(name)
    }

    /// Returns `(service port, node port)` for a NodePort service
    fn service_node_port(
        &self,
        namespace: &str,
        service_name: &str,
        port: Option<&ServiceBackendPort>,
    ) -> Result<(i32, i32)> {
        let key = format!("{namespace}/{service_name}");
        let service = self
            .source
            .service(namespace, service_name)
            .ok_or_else(|| Error::LookupError(format!("Unable to find the {key} service")))?;
        let spec = service
            .spec
            .as_ref()
            .ok_or_else(|| Error::LookupError(format!("{key} service has no spec")))?;

        if spec.type_.as_deref() != Some("NodePort") {
            return Err(Error::LookupError(format!(
                "{key} service is not of type NodePort"
            )));
        }

        let wanted_number = port.and_then(|p| p.number);
        let wanted_name = port.and_then(|p| p.name.as_deref());
        spec.ports
            .iter()
            .flatten()
            .find(|p| match (wanted_number, wanted_name) {
                (Some(number), _) => p.port == number,
                (None, Some(name)) => p.name.as_deref() == Some(name),
                (None, None) => false,
            })
            .and_then(|p| p.node_port.map(|node_port| (p.port, node_port)))
            .ok_or_else(|| {
                Error::LookupError(format!("Unable to find a port defined in the {key} service"))
            })
    }

    fn service_annotations(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let service = self.source.service(namespace, service_name).ok_or_else(|| {
            Error::LookupError(format!(
                "Unable to find the {namespace}/{service_name} service"
            ))
        })?;
        Ok(service.metadata.annotations.clone())
    }
}

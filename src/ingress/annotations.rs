//! Ingress annotation interpretation
//!
//! Turns `alb.ingress.kubernetes.io/*` annotations into validated
//! [`Annotations`]. The convergence engine only depends on the
//! [`AnnotationInterpreter`] trait; [`DefaultAnnotationInterpreter`] is the
//! implementation wired into the binary.

use std::collections::BTreeMap;

use tracing::debug;

use super::{Protocol, ResourceId, Scheme};
use crate::controller::EventSource;
use crate::error::{Error, Result};

pub const ANNOTATION_PREFIX: &str = "alb.ingress.kubernetes.io/";

/// ConfigMap listing the ingresses allowed to be internet-facing when the
/// scheme restriction is enabled
pub const INTERNET_FACING_ALLOWLIST: &str = "alb-ingress-controller-internet-facing-ingresses";

const SCHEME: &str = "scheme";
const SUBNETS: &str = "subnets";
const SECURITY_GROUPS: &str = "security-groups";
const LISTEN_PORTS: &str = "listen-ports";
const CERTIFICATE_ARN: &str = "certificate-arn";
const SSL_POLICY: &str = "ssl-policy";
const WAF_ACL_ID: &str = "waf-acl-id";
const TAGS: &str = "tags";
const HEALTHCHECK_PATH: &str = "healthcheck-path";
const HEALTHCHECK_PORT: &str = "healthcheck-port";
const BACKEND_PROTOCOL: &str = "backend-protocol";
const SUCCESS_CODES: &str = "success-codes";

/// Validated configuration derived from an ingress (and, for target groups,
/// the backend service's annotations layered on top)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotations {
    pub scheme: Scheme,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub listen_ports: Vec<(Protocol, u16)>,
    pub certificate_arn: Option<String>,
    pub ssl_policy: Option<String>,
    pub web_acl_id: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub health_check_path: String,
    pub health_check_port: String,
    pub backend_protocol: Protocol,
    pub success_codes: String,
}

impl Default for Annotations {
    fn default() -> Self {
        Self {
            scheme: Scheme::Internal,
            subnets: Vec::new(),
            security_groups: Vec::new(),
            listen_ports: vec![(Protocol::Http, 80)],
            certificate_arn: None,
            ssl_policy: None,
            web_acl_id: None,
            tags: BTreeMap::new(),
            health_check_path: "/".to_string(),
            health_check_port: "traffic-port".to_string(),
            backend_protocol: Protocol::Http,
            success_codes: "200".to_string(),
        }
    }
}

/// Yields validated configuration for one ingress, or an error that the
/// caller treats as a per-resource failure.
pub trait AnnotationInterpreter: Send + Sync {
    fn parse(
        &self,
        id: &ResourceId,
        annotations: &BTreeMap<String, String>,
        source: &dyn EventSource,
    ) -> Result<Annotations>;
}

/// Restricts `internet-facing` load balancers to an allowlist
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemeRestriction {
    pub enabled: bool,
    /// Namespace holding the allowlist ConfigMap
    pub namespace: String,
}

impl Default for SchemeRestriction {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "default".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DefaultAnnotationInterpreter {
    restriction: SchemeRestriction,
}

impl DefaultAnnotationInterpreter {
    pub fn new(restriction: SchemeRestriction) -> Self {
        Self { restriction }
    }

    fn internet_facing_allowed(&self, id: &ResourceId, source: &dyn EventSource) -> bool {
        if !self.restriction.enabled {
            return true;
        }
        let Some(config_map) =
            source.config_map(&self.restriction.namespace, INTERNET_FACING_ALLOWLIST)
        else {
            debug!(
                "Allowlist {}/{} not found; denying internet-facing scheme for {}",
                self.restriction.namespace, INTERNET_FACING_ALLOWLIST, id
            );
            return false;
        };

        config_map
            .data
            .as_ref()
            .and_then(|data| data.get(&id.namespace))
            .map(|names| names.split(',').any(|n| n.trim() == id.name))
            .unwrap_or(false)
    }
}

impl AnnotationInterpreter for DefaultAnnotationInterpreter {
    fn parse(
        &self,
        id: &ResourceId,
        annotations: &BTreeMap<String, String>,
        source: &dyn EventSource,
    ) -> Result<Annotations> {
        let get = |key: &str| {
            annotations
                .get(&format!("{ANNOTATION_PREFIX}{key}"))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let mut parsed = Annotations::default();

        if let Some(scheme) = get(SCHEME) {
            parsed.scheme = parse_scheme(scheme)?;
        }
        if parsed.scheme == Scheme::InternetFacing && !self.internet_facing_allowed(id, source) {
            return Err(invalid(
                SCHEME,
                format!("{id} is not allowed to use an internet-facing load balancer"),
            ));
        }

        if let Some(subnets) = get(SUBNETS) {
            parsed.subnets = split_list(subnets);
        }
        if let Some(groups) = get(SECURITY_GROUPS) {
            parsed.security_groups = split_list(groups);
        }
        if let Some(ports) = get(LISTEN_PORTS) {
            parsed.listen_ports = parse_listen_ports(ports)?;
        }
        parsed.certificate_arn = get(CERTIFICATE_ARN).map(String::from);
        parsed.ssl_policy = get(SSL_POLICY).map(String::from);
        parsed.web_acl_id = get(WAF_ACL_ID).map(String::from);

        let wants_https = parsed
            .listen_ports
            .iter()
            .any(|(protocol, _)| *protocol == Protocol::Https);
        if wants_https && parsed.certificate_arn.is_none() {
            return Err(invalid(
                LISTEN_PORTS,
                "an HTTPS listener requires a certificate-arn".to_string(),
            ));
        }

        if let Some(tags) = get(TAGS) {
            parsed.tags = parse_tags(tags)?;
        }
        if let Some(path) = get(HEALTHCHECK_PATH) {
            if !path.starts_with('/') {
                return Err(invalid(HEALTHCHECK_PATH, format!("{path} must start with /")));
            }
            parsed.health_check_path = path.to_string();
        }
        if let Some(port) = get(HEALTHCHECK_PORT) {
            if port != "traffic-port" && port.parse::<u16>().map_or(true, |p| p == 0) {
                return Err(invalid(
                    HEALTHCHECK_PORT,
                    format!("{port} is neither traffic-port nor a port number"),
                ));
            }
            parsed.health_check_port = port.to_string();
        }
        if let Some(protocol) = get(BACKEND_PROTOCOL) {
            parsed.backend_protocol = parse_protocol(BACKEND_PROTOCOL, protocol)?;
        }
        if let Some(codes) = get(SUCCESS_CODES) {
            parsed.success_codes = codes.to_string();
        }

        Ok(parsed)
    }
}

fn invalid(key: &str, message: String) -> Error {
    Error::AnnotationError {
        key: format!("{ANNOTATION_PREFIX}{key}"),
        message,
    }
}

fn parse_scheme(value: &str) -> Result<Scheme> {
    match value {
        "internal" => Ok(Scheme::Internal),
        "internet-facing" => Ok(Scheme::InternetFacing),
        other => Err(invalid(
            SCHEME,
            format!("{other} must be internal or internet-facing"),
        )),
    }
}

fn parse_protocol(key: &str, value: &str) -> Result<Protocol> {
    match value.to_ascii_uppercase().as_str() {
        "HTTP" => Ok(Protocol::Http),
        "HTTPS" => Ok(Protocol::Https),
        other => Err(invalid(key, format!("unsupported protocol {other}"))),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parses `[{"HTTP": 80}, {"HTTPS": 443}]`
fn parse_listen_ports(value: &str) -> Result<Vec<(Protocol, u16)>> {
    let entries: Vec<BTreeMap<String, u16>> = serde_json::from_str(value)
        .map_err(|e| invalid(LISTEN_PORTS, format!("malformed JSON: {e}")))?;

    let mut ports = Vec::new();
    for entry in entries {
        for (protocol, port) in entry {
            if port == 0 {
                return Err(invalid(LISTEN_PORTS, "port 0 is not allowed".to_string()));
            }
            ports.push((parse_protocol(LISTEN_PORTS, &protocol)?, port));
        }
    }
    if ports.is_empty() {
        return Err(invalid(LISTEN_PORTS, "no listeners defined".to_string()));
    }
    ports.sort_by_key(|(_, port)| *port);
    ports.dedup();
    Ok(ports)
}

/// Parses `Environment=dev,Team=web`
fn parse_tags(value: &str) -> Result<BTreeMap<String, String>> {
    split_list(value)
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(invalid(TAGS, format!("{pair} is not a key=value pair"))),
        })
        .collect()
}

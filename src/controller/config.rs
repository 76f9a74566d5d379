//! Controller configuration
//!
//! [`ControllerArgs`] is the raw, unvalidated input (flags and environment).
//! [`ControllerArgs::validate`] is the only way to obtain a
//! [`ControllerConfig`]; any failure there is fatal and aborts startup.

use std::time::Duration;

use tracing::info;

use super::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::ingress::SchemeRestriction;

/// Longest prefix that keeps generated provider names within 32 characters
pub const MAX_PREFIX_LEN: usize = 11;

#[derive(clap::Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Cluster name (required)
    #[arg(long, env = "CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    /// Prefix to add to ALB resources (11 lowercase alphanumeric characters or less)
    #[arg(long, env = "ALB_PREFIX")]
    pub alb_name_prefix: Option<String>,

    /// Restrict the scheme to internal except for allowlisted ingresses
    #[arg(long, env = "ALB_CONTROLLER_RESTRICT_SCHEME", default_value = "false")]
    pub restrict_scheme: String,

    /// Namespace holding the ConfigMap of ingresses allowed to be internet-facing
    #[arg(
        long,
        env = "ALB_CONTROLLER_RESTRICT_SCHEME_CONFIG_NAMESPACE",
        default_value = "default"
    )]
    pub restrict_scheme_namespace: String,

    /// Frequency with which to resync ALBs for external changes
    #[arg(long, env = "ALB_SYNC_INTERVAL", default_value = "60m")]
    pub alb_sync_interval: String,

    /// Ingress class to handle; empty handles unclassed and `alb` ingresses
    #[arg(long, env = "INGRESS_CLASS", default_value = "")]
    pub ingress_class: String,

    /// Deadline for one load balancer's reconciliation
    #[arg(long, env = "ALB_RECONCILE_TIMEOUT", default_value = "5m")]
    pub reconcile_timeout: String,

    /// Consecutive failures after which a resource is parked
    #[arg(long, env = "ALB_MAX_RECONCILE_FAILURES", default_value_t = 10)]
    pub max_reconcile_failures: u32,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            alb_name_prefix: None,
            restrict_scheme: "false".to_string(),
            restrict_scheme_namespace: "default".to_string(),
            alb_sync_interval: "60m".to_string(),
            ingress_class: String::new(),
            reconcile_timeout: "5m".to_string(),
            max_reconcile_failures: 10,
        }
    }
}

/// Validated, immutable controller configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub cluster_name: String,
    pub alb_name_prefix: String,
    pub restriction: SchemeRestriction,
    pub sync_interval: Duration,
    pub ingress_class: String,
    pub reconcile_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ControllerArgs {
    pub fn validate(self) -> Result<ControllerConfig> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::ConfigError(
                "A cluster name must be defined".to_string(),
            ));
        }

        let prefix = match self.alb_name_prefix.filter(|p| !p.is_empty()) {
            Some(prefix) => prefix,
            None => {
                let derived = derive_prefix(&self.cluster_name);
                info!("albNamePrefix undefined, defaulting to {}", derived);
                derived
            }
        };
        validate_prefix(&prefix)?;

        let restrict = parse_bool(&self.restrict_scheme).ok_or_else(|| {
            Error::ConfigError(format!(
                "ALB_CONTROLLER_RESTRICT_SCHEME must be either true or false. Value was: {}",
                self.restrict_scheme
            ))
        })?;
        if self.restrict_scheme_namespace.trim().is_empty() {
            return Err(Error::ConfigError(
                "restrict-scheme-namespace must not be empty".to_string(),
            ));
        }

        let sync_interval = positive_duration("ALB_SYNC_INTERVAL", &self.alb_sync_interval)?;
        let reconcile_timeout =
            positive_duration("ALB_RECONCILE_TIMEOUT", &self.reconcile_timeout)?;

        Ok(ControllerConfig {
            cluster_name: self.cluster_name,
            alb_name_prefix: prefix,
            restriction: SchemeRestriction {
                enabled: restrict,
                namespace: self.restrict_scheme_namespace,
            },
            sync_interval,
            ingress_class: self.ingress_class,
            reconcile_timeout,
            retry: RetryPolicy {
                max_failures: self.max_reconcile_failures.max(1),
                ..RetryPolicy::default()
            },
        })
    }
}

/// Truncate to 11 characters, lower-case, then drop anything outside `[a-z0-9]`
pub fn derive_prefix(cluster_name: &str) -> String {
    let truncated: String = cluster_name.chars().take(MAX_PREFIX_LEN).collect();
    strip_disallowed(&truncated.to_lowercase())
}

pub fn validate_prefix(prefix: &str) -> Result<()> {
    if strip_disallowed(prefix) != prefix {
        return Err(Error::ConfigError(
            "ALB prefix can only include lower case alphanumeric characters".to_string(),
        ));
    }
    if prefix.len() > MAX_PREFIX_LEN {
        return Err(Error::ConfigError(format!(
            "ALB prefix must be {MAX_PREFIX_LEN} characters or less"
        )));
    }
    if prefix.is_empty() {
        return Err(Error::ConfigError(
            "ALB prefix must not be empty; set ALB_PREFIX explicitly".to_string(),
        ));
    }
    Ok(())
}

fn strip_disallowed(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn positive_duration(setting: &str, value: &str) -> Result<Duration> {
    let duration = parse_duration(value).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to parse duration from {setting} value of '{value}': {e}"
        ))
    })?;
    if duration.is_zero() {
        return Err(Error::ConfigError(format!("{setting} must be greater than zero")));
    }
    Ok(duration)
}

/// Parse a duration such as `60m`, `1h30m`, `90s`, `1.5h` or `250ms`
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("Missing unit in duration {s}"))?;
        if num_len == 0 {
            return Err(format!("Invalid duration {s}"));
        }
        let (num_str, tail) = rest.split_at(num_len);
        let num: f64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number: {num_str}"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let seconds = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("Invalid duration unit: {unit}")),
        };
        total += num * seconds;
        rest = tail;
    }

    Duration::try_from_secs_f64(total).map_err(|e| e.to_string())
}

//! Connectivity probes against the controller's external dependencies
//!
//! Probes are registered once at startup and executed on demand; every
//! status request recomputes the results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

/// Result string reported for a passing probe
pub const HEALTHY: &str = "OK";

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> HealthProbe for F
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    async fn check(&self) -> anyhow::Result<()> {
        self()
    }
}

/// Succeeds when the endpoint answers a HEAD request with a 2xx or 3xx status
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .user_agent(concat!("alb-ingress-controller/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> anyhow::Result<()> {
        debug!("Probing {}", self.url);
        let resp = self.client.head(&self.url).send().await?;
        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            anyhow::bail!("{} returned HTTP {}", self.url, status)
        }
    }
}

/// Succeeds when the Kubernetes API server reports its version
///
/// The kube client has no request deadline of its own; [`HealthMonitor`]
/// bounds it.
pub struct KubeApiProbe {
    client: kube::Client,
}

impl KubeApiProbe {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for KubeApiProbe {
    async fn check(&self) -> anyhow::Result<()> {
        let version = self.client.apiserver_version().await?;
        debug!("API server reachable, version {}", version.git_version);
        Ok(())
    }
}

/// Name to result mapping plus the aggregate verdict
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub results: BTreeMap<String, String>,
    pub healthy: bool,
}

#[derive(Clone, Default)]
pub struct HealthMonitor {
    checks: BTreeMap<String, Arc<dyn HealthProbe>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        self.checks.insert(name.into(), probe);
        self
    }

    /// Run every probe; any failure makes the report unhealthy.
    ///
    /// Each probe gets [`PROBE_TIMEOUT`]; callers hold the state read guard
    /// while this runs.
    pub async fn run(&self) -> HealthReport {
        let outcomes =
            futures::future::join_all(self.checks.values().map(|probe| bounded(probe.as_ref())))
                .await;

        let mut report = HealthReport {
            results: BTreeMap::new(),
            healthy: true,
        };
        for (name, outcome) in self.checks.keys().zip(outcomes) {
            let result = match outcome {
                Ok(()) => HEALTHY.to_string(),
                Err(e) => {
                    report.healthy = false;
                    format!("{e:#}")
                }
            };
            report.results.insert(name.clone(), result);
        }
        report
    }
}

async fn bounded(probe: &dyn HealthProbe) -> anyhow::Result<()> {
    match tokio::time::timeout(PROBE_TIMEOUT, probe.check()).await {
        Ok(outcome) => outcome,
        Err(_) => anyhow::bail!("timed out after {}s", PROBE_TIMEOUT.as_secs()),
    }
}

/// Parse a `NAME=URL` health endpoint argument
pub fn parse_endpoint(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
            Ok((name.trim().to_string(), url.trim().to_string()))
        }
        _ => Err(format!("expected NAME=URL, got {raw:?}")),
    }
}

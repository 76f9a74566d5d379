//! Prometheus metrics for the ALB ingress controller
//!
//! # Exported metrics
//! - `alb_managed_ingresses` (gauge): ingresses tracked per namespace after the last committed pass.
//! - `alb_on_update_total` (counter): convergence passes started.
//! - `alb_reconcile_duration_seconds` (histogram): pass duration labeled by pass kind.
//! - `alb_reconcile_errors_total` (counter): per-resource failures labeled by error kind.
//! - `alb_parked_resources` (gauge): resources parked after repeated failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NamespaceLabels {
    pub namespace: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PassLabels {
    /// "converge" or "resync"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error category, e.g. "reconcile", "timeout", "lookup"
    pub kind: String,
}

pub static MANAGED_INGRESSES: Lazy<Family<NamespaceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static ON_UPDATE_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static PARKED_RESOURCES: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static RECONCILE_DURATION_SECONDS: Lazy<Family<PassLabels, Histogram>> = Lazy::new(|| {
    fn pass_histogram() -> Histogram {
        // 10ms .. ~5.5min across 16 buckets.
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }

    Family::new_with_constructor(pass_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "alb_managed_ingresses",
        "Number of ingresses managed per namespace",
        MANAGED_INGRESSES.clone(),
    );
    registry.register(
        "alb_on_update",
        "Number of convergence passes started",
        ON_UPDATE_TOTAL.clone(),
    );
    registry.register(
        "alb_parked_resources",
        "Resources skipped after reaching the consecutive failure limit",
        PARKED_RESOURCES.clone(),
    );
    registry.register(
        "alb_reconcile_duration_seconds",
        "Duration of convergence passes and drift resyncs in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "alb_reconcile_errors",
        "Number of per-resource reconcile failures",
        RECONCILE_ERRORS_TOTAL.clone(),
    );

    registry
});

pub fn inc_on_update() {
    ON_UPDATE_TOTAL.inc();
}

pub fn observe_pass_duration_seconds(kind: &str, seconds: f64) {
    let labels = PassLabels {
        kind: kind.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile_error(kind: &str) {
    let labels = ErrorLabels {
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_parked_resources(count: usize) {
    PARKED_RESOURCES.set(count as i64);
}

/// Publish namespace counts; namespaces that dropped out are reset to zero
pub fn set_managed_ingresses(
    previous: &BTreeMap<String, usize>,
    current: &BTreeMap<String, usize>,
) {
    for namespace in previous.keys().filter(|ns| !current.contains_key(*ns)) {
        MANAGED_INGRESSES
            .get_or_create(&NamespaceLabels {
                namespace: namespace.clone(),
            })
            .set(0);
    }
    for (namespace, count) in current {
        MANAGED_INGRESSES
            .get_or_create(&NamespaceLabels {
                namespace: namespace.clone(),
            })
            .set(*count as i64);
    }
}

/// Text exposition of [`REGISTRY`]
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_ingresses_resets_vanished_namespaces() {
        let before = BTreeMap::from([("metrics-a".to_string(), 2), ("metrics-b".to_string(), 1)]);
        let after = BTreeMap::from([("metrics-a".to_string(), 3)]);
        set_managed_ingresses(&BTreeMap::new(), &before);
        set_managed_ingresses(&before, &after);

        let gauge = |ns: &str| {
            MANAGED_INGRESSES
                .get_or_create(&NamespaceLabels {
                    namespace: ns.to_string(),
                })
                .get()
        };
        assert_eq!(gauge("metrics-a"), 3);
        assert_eq!(gauge("metrics-b"), 0);
    }

    #[test]
    fn test_registry_encodes() {
        inc_on_update();
        inc_reconcile_error("timeout");
        observe_pass_duration_seconds("converge", 0.25);
        let text = encode().unwrap();
        assert!(text.contains("alb_on_update_total"));
        assert!(text.contains("alb_reconcile_errors_total"));
    }
}

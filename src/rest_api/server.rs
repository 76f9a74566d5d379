//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::AlbController;
use crate::Result;

use super::handlers;

pub fn router(controller: Arc<AlbController>) -> Router {
    Router::new()
        .route("/state", get(handlers::state))
        .route("/status", get(handlers::status))
        .route("/readyz", get(handlers::readiness))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

/// Run the REST API server
pub async fn run_server(controller: Arc<AlbController>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("REST API server listening on {}", addr);
    axum::serve(listener, router(controller)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::controller::testing::{config, Harness};
    use crate::controller::{HealthMonitor, HealthProbe};

    fn ok_probe() -> Arc<dyn HealthProbe> {
        Arc::new(|| -> anyhow::Result<()> { Ok(()) })
    }

    fn failing_probe() -> Arc<dyn HealthProbe> {
        Arc::new(|| -> anyhow::Result<()> { anyhow::bail!("connection refused") })
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_status_healthy_returns_empty_body() {
        let monitor = HealthMonitor::new()
            .with_check("ec2", ok_probe())
            .with_check("elbv2", ok_probe());
        let h = Harness::with(config(), monitor);

        let (status, content_type, body) = get(router(h.controller.clone()), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json; charset=utf-8"));
        assert_eq!(body, "{}\n");
    }

    #[tokio::test]
    async fn test_status_full_lists_every_check() {
        let monitor = HealthMonitor::new()
            .with_check("ec2", ok_probe())
            .with_check("elbv2", ok_probe());
        let h = Harness::with(config(), monitor);

        let (status, _, body) = get(router(h.controller.clone()), "/status?full=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{\n    \"ec2\": \"OK\",\n    \"elbv2\": \"OK\"\n}\n");
    }

    #[tokio::test]
    async fn test_status_single_failure_is_unavailable() {
        let monitor = HealthMonitor::new()
            .with_check("ec2", ok_probe())
            .with_check("elbv2", failing_probe());
        let h = Harness::with(config(), monitor);

        let (status, _, body) = get(router(h.controller.clone()), "/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "{}\n");

        let (status, _, body) = get(router(h.controller.clone()), "/status?full=1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let results: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(results["ec2"], "OK");
        assert_eq!(results["elbv2"], "connection refused");
    }

    #[tokio::test]
    async fn test_state_exports_registry() {
        let h = Harness::new();
        h.source.serve("default", "web");
        h.controller.on_update().await;

        let (status, content_type, body) = get(router(h.controller.clone()), "/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));

        let snapshot: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(snapshot["passes"], 1);
        assert_eq!(snapshot["namespaces"]["default"], 1);
        assert_eq!(snapshot["ingresses"][0]["id"]["name"], "web");
        assert!(snapshot["ingresses"][0]["handle"]["arn"].is_string());
    }

    #[tokio::test]
    async fn test_readiness_follows_startup() {
        let h = Harness::new();
        let (status, _, _) = get(router(h.controller.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let running = h.controller.clone().start().await;
        let (status, _, body) = get(router(h.controller.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"ready\":true"));
        running.shutdown();
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let h = Harness::new();
        h.controller.on_update().await;

        let (status, _, body) = get(router(h.controller.clone()), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("alb_on_update_total"));
    }
}

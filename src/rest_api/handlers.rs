//! HTTP handlers for the REST API

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use tracing::{error, instrument};

use crate::controller::{metrics, AlbController, RegistrySnapshot};

use super::dto::{ErrorResponse, ReadinessResponse, StatusQuery};

const JSON_UTF8: &str = "application/json; charset=utf-8";
const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Body written by `/status` unless `full=1` is requested
pub const EMPTY_STATUS_BODY: &str = "{}\n";

/// Registry export
#[instrument(skip(controller))]
pub async fn state(State(controller): State<Arc<AlbController>>) -> Json<RegistrySnapshot> {
    Json(controller.export().await)
}

/// Connectivity checks; 503 when any probe fails
#[instrument(skip(controller))]
pub async fn status(
    State(controller): State<Arc<AlbController>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let report = controller.collect_checks().await;
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = if query.wants_full() {
        pretty_json(&report.results).unwrap_or_else(|e| {
            error!("Failed to encode health results: {}", e);
            EMPTY_STATUS_BODY.to_string()
        })
    } else {
        EMPTY_STATUS_BODY.to_string()
    };

    (code, [(header::CONTENT_TYPE, JSON_UTF8)], body).into_response()
}

/// Ready once the initial provider resync has completed
#[instrument(skip(controller))]
pub async fn readiness(
    State(controller): State<Arc<AlbController>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let ready = controller.is_ready();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadinessResponse {
            ready,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Prometheus text exposition
pub async fn metrics() -> Response {
    match metrics::encode() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, OPENMETRICS)], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("metrics_failed", &e.to_string())),
            )
                .into_response()
        }
    }
}

/// Four-space indented JSON with a trailing newline
fn pretty_json(results: &BTreeMap<String, String>) -> serde_json::Result<String> {
    let mut buffer = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
    results.serialize(&mut serializer)?;
    buffer.push(b'\n');
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

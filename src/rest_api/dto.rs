//! Data Transfer Objects for the REST API

use serde::{Deserialize, Serialize};

/// Query string accepted by `GET /status`
#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub full: Option<String>,
}

impl StatusQuery {
    pub fn wants_full(&self) -> bool {
        self.full.as_deref() == Some("1")
    }
}

/// Readiness response
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub version: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

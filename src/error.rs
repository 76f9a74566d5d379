//! Error types for the ALB ingress controller

use thiserror::Error;

use crate::ingress::ResourceId;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing startup configuration. Never retried.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A service, port or node referenced by an ingress could not be resolved
    #[error("Lookup failed: {0}")]
    LookupError(String),

    /// Ingress annotations failed validation
    #[error("Invalid annotation {key}: {message}")]
    AnnotationError { key: String, message: String },

    /// The resource reconciler reported a failure for one resource
    #[error("Reconcile failed for {id}: {message}")]
    ReconcileError { id: ResourceId, message: String },

    /// A per-resource reconciliation exceeded its deadline
    #[error("Reconcile of {0} timed out")]
    ReconcileTimeout(ResourceId),

    /// The reconciliation task for a resource panicked or was cancelled
    #[error("Reconcile task for {id} aborted: {message}")]
    TaskAborted { id: ResourceId, message: String },

    /// Provider inventory could not be assembled
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// I/O error (listener binding, serving)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Errors raised while the controller is starting up and must abort it
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConfigError(_))
    }

    /// Whether a later pass may succeed. A resource whose reconcile fails
    /// with a non-retriable error is parked at once.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::ConfigError(_) | Error::AnnotationError { .. } => false,
            Error::SerializationError(_) => false,
            _ => true,
        }
    }

    /// Short label used for the error metric
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigError(_) => "config",
            Error::KubeError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) => "serialization",
            Error::LookupError(_) => "lookup",
            Error::AnnotationError { .. } => "annotation",
            Error::ReconcileError { .. } => "reconcile",
            Error::ReconcileTimeout(_) => "timeout",
            Error::TaskAborted { .. } => "aborted",
            Error::ProviderError(_) => "provider",
            Error::IoError(_) => "io",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal_and_not_retried() {
        let err = Error::ConfigError("A cluster name must be defined".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_per_resource_errors_are_retriable() {
        let id = ResourceId::new("default", "web");
        assert!(Error::ReconcileTimeout(id.clone()).is_retriable());
        assert!(Error::LookupError("default/svc".into()).is_retriable());
        let err = Error::ReconcileError {
            id,
            message: "throttled".into(),
        };
        assert!(err.is_retriable());
        assert!(!err.is_fatal());
        assert_eq!(err.kind(), "reconcile");
    }
}

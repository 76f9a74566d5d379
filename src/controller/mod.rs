//! Controller module for ALB ingress reconciliation
//!
//! This module contains the convergence engine, the timed triggers that
//! drive it, and the Kubernetes-facing collaborators.

mod alb;
pub mod config;
pub mod convergence;
pub mod events;
pub mod export;
pub mod health;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod state;
#[cfg(test)]
pub(crate) mod testing;
mod traits;
pub mod watch;

pub use alb::{AlbController, Collaborators, RunningController};
pub use config::{ControllerArgs, ControllerConfig};
pub use convergence::{ConvergenceEngine, PassReport};
pub use events::KubeEventRecorder;
pub use export::RegistrySnapshot;
pub use health::{HealthMonitor, HealthProbe, HealthReport, HttpProbe, KubeApiProbe};
pub use retry::RetryPolicy;
pub use state::{Registry, SharedState, SyncState};
pub use traits::{DiscoveryScope, EventRecorder, EventSource, EventType, ResourceReconciler};
pub use watch::KubeEventSource;

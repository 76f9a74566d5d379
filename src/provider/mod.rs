//! Resource reconciler implementations
//!
//! Cloud backends implement [`crate::controller::ResourceReconciler`]; the
//! in-memory [`DryRunProvider`] plans and simulates every change without
//! calling out to a cloud API.

pub mod dry_run;

pub use dry_run::{DryRunProvider, ProvisionedLoadBalancer};

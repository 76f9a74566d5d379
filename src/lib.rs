//! ALB ingress controller
//!
//! Watches Kubernetes Ingress resources and converges a set of
//! application load balancers towards them.

pub mod controller;
pub mod error;
pub mod ingress;
pub mod provider;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};

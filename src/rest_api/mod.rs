//! REST API module for the controller's HTTP surface
//!
//! Serves the registry export, connectivity status, readiness and metrics.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};

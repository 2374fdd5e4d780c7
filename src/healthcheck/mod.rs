//! Readiness gating for the process topology.
//!
//! The supervisor never starts the web client until the API process answers
//! its health endpoint. The gate is a fixed-interval HTTP poll with an overall
//! deadline; there is no external cancellation, only the deadline.

mod checker;
mod http;

pub use checker::{wait_until_healthy, HealthChecker, DEFAULT_POLL_INTERVAL};
pub use http::HttpChecker;

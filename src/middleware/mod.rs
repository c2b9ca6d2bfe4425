//! Middleware for observability.
//!
//! Request logging with latency tracking; metrics collection lives in
//! [`crate::metrics`].

pub mod logging;
pub mod metrics;

pub use logging::{request_logging, request_logging_simple};
pub use metrics::track_request_duration;

//! Trading coordinator library: consumer-group stream runtime, the
//! analyze/risk/execute/notify agents, the orchestrator state machine, and
//! the admin HTTP surface.
//!
//! Exposed so the `tradecoord`, `analyst`, `risk-manager`, `executor`, and
//! `notifier` binaries can each depend on the pieces they need.

pub mod admin;
pub mod agents;
pub mod broker;
pub mod config;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod pnl;
pub mod schemas;
pub mod stream_runtime;

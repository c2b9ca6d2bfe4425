//! Participating roles. Each module exposes a pure evaluation/compute
//! function plus a `run` entry point that wires it to the stream runtime.

pub mod analyst;
pub mod executor;
pub mod notifier;
pub mod risk;

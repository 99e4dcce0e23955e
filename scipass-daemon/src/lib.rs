//! SciPass daemon library.
//!
//! Exposes the daemon modules for integration testing. In production
//! `scipass-daemon` runs as a binary (main.rs).

pub mod cli;
pub mod health;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;

pub use orchestrator::Orchestrator;

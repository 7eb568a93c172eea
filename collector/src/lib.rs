//! Telemetry collector: users own devices, devices report triaxial readings,
//! and the service aggregates per-axis statistics over them, inline or as
//! background jobs.

pub mod config;
pub mod db;
pub mod errors;
pub mod filter;
pub mod jobs;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod repo;
pub mod rest;
pub mod stats;
pub mod validate;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

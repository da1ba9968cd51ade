//! HTTP endpoint handlers for the server.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/start_detection`, `/stop_detection`: Run control
//! - `/get_stats`, `/get_time_series`: Live statistics
//! - `/api/sessions`, `/api/metrics`: Stored sessions and snapshots
//! - `/health`: Health check endpoint
//! - `/metrics`: Prometheus metrics endpoint

pub mod control;
pub mod health;
pub mod metrics;
pub mod sessions;
pub mod stats;

// Re-export handlers
pub use control::{start_handler, stop_handler};
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use sessions::{metrics_records_handler, sessions_handler};
pub use stats::{stats_handler, time_series_handler};

//! Application state management for the server.
//!
//! This module defines the shared application state that is passed
//! to HTTP handlers and to the shutdown path.

use prometheus::Registry;
use std::sync::Arc;
use std::time::Instant;
use varroa_monitor::{Config, MetricsStore, Supervisor};

use crate::metrics::DetectionMetrics;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Global application state shared across requests.
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub store: Arc<dyn MetricsStore>,
    pub registry: Registry,
    pub metrics: DetectionMetrics,
    pub config: Arc<Config>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

//! Statistics endpoint handlers.

use axum::{extract::State, Json};
use tracing::{debug, instrument};
use varroa_monitor::{DetectionStats, TimeSeriesSnapshot};

use crate::state::SharedState;

/// Handler for `GET /get_stats`.
#[instrument(skip(state))]
pub async fn stats_handler(State(state): State<SharedState>) -> Json<DetectionStats> {
    debug!("Processing /get_stats request");
    Json(state.supervisor.stats())
}

/// Handler for `GET /get_time_series`.
#[instrument(skip(state))]
pub async fn time_series_handler(State(state): State<SharedState>) -> Json<TimeSeriesSnapshot> {
    debug!("Processing /get_time_series request");
    Json(state.supervisor.time_series())
}

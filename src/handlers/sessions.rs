//! Stored session and metric endpoints.
//!
//! Both endpoints return records newest first.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use tracing::{debug, instrument};
use varroa_monitor::store::{MetricsRecord, SessionRecord};
use varroa_monitor::SessionId;

use crate::state::SharedState;

const DEFAULT_SESSION_LIMIT: usize = 10;
const DEFAULT_METRICS_LIMIT: usize = 100;
const MAX_LIMIT: usize = 10_000;

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub limit: Option<usize>,
    pub session_id: Option<SessionId>,
}

/// Handler for `GET /api/sessions`.
#[instrument(skip(state))]
pub async fn sessions_handler(
    State(state): State<SharedState>,
    Query(query): Query<SessionsQuery>,
) -> Json<Vec<SessionRecord>> {
    debug!("Processing /api/sessions request");
    let limit = query.limit.unwrap_or(DEFAULT_SESSION_LIMIT).min(MAX_LIMIT);
    Json(state.store.sessions(limit))
}

/// Handler for `GET /api/metrics`.
#[instrument(skip(state))]
pub async fn metrics_records_handler(
    State(state): State<SharedState>,
    Query(query): Query<MetricsQuery>,
) -> Json<Vec<MetricsRecord>> {
    debug!("Processing /api/metrics request");
    let limit = query.limit.unwrap_or(DEFAULT_METRICS_LIMIT).min(MAX_LIMIT);
    Json(state.store.latest_metrics(limit, query.session_id))
}

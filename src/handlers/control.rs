//! Run control endpoint handlers.
//!
//! `POST /start_detection` and `POST /stop_detection` answer with a coarse
//! status only; details go to the log. Both run on the blocking pool because
//! start sweeps and launches, and stop waits for teardown.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::{debug, error, instrument};
use varroa_monitor::{StartStatus, StopStatus};

use crate::state::SharedState;

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
}

fn status_response(code: StatusCode, status: &'static str) -> axum::response::Response {
    (code, Json(StatusBody { status })).into_response()
}

/// Handler for `POST /start_detection`.
#[instrument(skip(state))]
pub async fn start_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /start_detection request");
    let supervisor = state.supervisor.clone();

    match tokio::task::spawn_blocking(move || supervisor.start()).await {
        Ok(Ok(StartStatus::Started)) => status_response(StatusCode::OK, "started"),
        Ok(Ok(StartStatus::AlreadyRunning)) => status_response(StatusCode::OK, "already_running"),
        Ok(Err(e)) => {
            error!("Start failed: {}", e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "launch_failed")
        }
        Err(e) => {
            error!("Start task failed: {}", e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "launch_failed")
        }
    }
}

/// Handler for `POST /stop_detection`.
#[instrument(skip(state))]
pub async fn stop_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /stop_detection request");
    let supervisor = state.supervisor.clone();

    match tokio::task::spawn_blocking(move || supervisor.stop()).await {
        Ok(StopStatus::Stopped) => status_response(StatusCode::OK, "stopped"),
        Ok(StopStatus::AlreadyStopped) => status_response(StatusCode::OK, "already_stopped"),
        Err(e) => {
            error!("Stop task failed: {}", e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "stop_failed")
        }
    }
}

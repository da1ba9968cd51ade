//! Health check endpoint handler.
//!
//! This module provides the `/health` endpoint handler that returns
//! run state, uptime and supervisor counters as plain text.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::fmt::Write as FmtWrite;
use tracing::{debug, instrument};

use crate::state::SharedState;

// Time conversion constants
const SECONDS_PER_HOUR: f64 = 3600.0;
const MINUTES_PER_HOUR: f64 = 60.0;
const HOURS_PER_DAY: f64 = 24.0;

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");

    let supervisor = &state.supervisor;
    let run_state = supervisor.state();
    let counters = supervisor.counters();
    let stats = supervisor.stats();

    let uptime_str = format_uptime(state.uptime_seconds());

    let mut out = String::new();
    writeln!(out, "OK - {}", run_state).ok();
    writeln!(out).ok();
    writeln!(out, "Uptime: {uptime_str}").ok();
    writeln!(out).ok();

    writeln!(out, "RUN").ok();
    writeln!(out, "===").ok();
    writeln!(out, "{:22} {}", "state:", run_state).ok();
    writeln!(
        out,
        "{:22} {}",
        "pipeline pid:",
        supervisor
            .pipeline_pid()
            .map_or_else(|| "-".to_string(), |p| p.to_string())
    )
    .ok();
    writeln!(
        out,
        "{:22} {}",
        "session:",
        supervisor
            .current_session()
            .map_or_else(|| "-".to_string(), |s| s.to_string())
    )
    .ok();
    writeln!(out, "{:22} {}", "frames:", stats.total_frames).ok();
    writeln!(out, "{:22} {:.1}", "fps:", stats.fps).ok();
    writeln!(out, "{:22} {}", "risk level:", stats.infestation_risk_level).ok();
    writeln!(out, "{:22} {}", "command:", state.config.pipeline.command).ok();
    writeln!(
        out,
        "{:22} {}",
        "store:",
        state
            .config
            .store
            .path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string())
    )
    .ok();
    writeln!(out).ok();

    writeln!(out, "COUNTERS").ok();
    writeln!(out, "========").ok();
    writeln!(out, "{:22} {}", "runs started:", counters.runs_started).ok();
    writeln!(out, "{:22} {}", "launch failures:", counters.launch_failures).ok();
    writeln!(out, "{:22} {}", "lines read:", counters.lines_read).ok();
    writeln!(out, "{:22} {}", "parse skips:", counters.parse_skips).ok();
    writeln!(out, "{:22} {}", "persist failures:", counters.persist_failures).ok();
    writeln!(out, "{:22} {}", "processes reaped:", counters.processes_reaped).ok();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        out,
    )
}

fn format_uptime(uptime_seconds: f64) -> String {
    let uptime_hours = uptime_seconds / SECONDS_PER_HOUR;
    if uptime_hours < 1.0 {
        format!("{:.1} minutes", uptime_hours * MINUTES_PER_HOUR)
    } else if uptime_hours < HOURS_PER_DAY {
        format!("{:.1} hours", uptime_hours)
    } else {
        format!("{:.1} days", uptime_hours / HOURS_PER_DAY)
    }
}

//! Prometheus metrics definitions for varroa-monitor.
//!
//! Gauges mirror the current detection snapshot and are refreshed on every
//! scrape. Counters follow the supervisor's monotonic counters.

use prometheus::{Gauge, IntCounter, IntGauge, Registry};
use varroa_monitor::supervisor::CountersSnapshot;
use varroa_monitor::{DetectionStats, RunState};

/// Collection of Prometheus metrics exported on /metrics.
#[derive(Clone)]
pub struct DetectionMetrics {
    // ========== Detection Snapshot ==========
    pub frames_total: IntGauge,
    pub unique_bees: IntGauge,
    pub unique_varroa: IntGauge,
    pub current_bees: IntGauge,
    pub current_varroa: IntGauge,
    pub fps: Gauge,
    pub infestation_ratio: Gauge,
    /// 0=Unknown, 1=Low, 2=Moderate, 3=High, 4=Critical
    pub risk_level: IntGauge,

    // ========== Supervisor ==========
    /// 0=Idle, 1=Starting, 2=Running, 3=Stopping
    pub run_state: IntGauge,
    pub uptime_seconds: Gauge,
    pub runs_started_total: IntCounter,
    pub launch_failures_total: IntCounter,
    pub lines_read_total: IntCounter,
    pub parse_skips_total: IntCounter,
    pub persist_failures_total: IntCounter,
    pub processes_reaped_total: IntCounter,
}

impl DetectionMetrics {
    /// Creates and registers all Prometheus metrics with the registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            frames_total: IntGauge::new(
                "varroa_frames_total",
                "Frames processed by the current run",
            )?,
            unique_bees: IntGauge::new(
                "varroa_unique_bees",
                "Distinct bees tracked in the current run",
            )?,
            unique_varroa: IntGauge::new(
                "varroa_unique_varroa",
                "Distinct varroa mites tracked in the current run",
            )?,
            current_bees: IntGauge::new("varroa_current_bees", "Bees in the latest frame")?,
            current_varroa: IntGauge::new(
                "varroa_current_varroa",
                "Varroa mites in the latest frame",
            )?,
            fps: Gauge::new("varroa_fps", "Pipeline frame rate")?,
            infestation_ratio: Gauge::new(
                "varroa_infestation_ratio",
                "Unique varroa per unique bee (0 when no bees)",
            )?,
            risk_level: IntGauge::new(
                "varroa_infestation_risk_level",
                "Risk level: 0=Unknown 1=Low 2=Moderate 3=High 4=Critical",
            )?,
            run_state: IntGauge::new(
                "varroa_monitor_run_state",
                "Run state: 0=Idle 1=Starting 2=Running 3=Stopping",
            )?,
            uptime_seconds: Gauge::new(
                "varroa_monitor_uptime_seconds",
                "Seconds since the server started",
            )?,
            runs_started_total: IntCounter::new(
                "varroa_monitor_runs_started_total",
                "Pipeline runs started",
            )?,
            launch_failures_total: IntCounter::new(
                "varroa_monitor_launch_failures_total",
                "Pipeline launches that failed",
            )?,
            lines_read_total: IntCounter::new(
                "varroa_monitor_lines_read_total",
                "Pipeline stdout lines read",
            )?,
            parse_skips_total: IntCounter::new(
                "varroa_monitor_parse_skips_total",
                "Markers whose value could not be parsed",
            )?,
            persist_failures_total: IntCounter::new(
                "varroa_monitor_persist_failures_total",
                "Metric snapshots the store rejected",
            )?,
            processes_reaped_total: IntCounter::new(
                "varroa_monitor_processes_reaped_total",
                "Leftover processes signaled by the reaper",
            )?,
        };

        registry.register(Box::new(metrics.frames_total.clone()))?;
        registry.register(Box::new(metrics.unique_bees.clone()))?;
        registry.register(Box::new(metrics.unique_varroa.clone()))?;
        registry.register(Box::new(metrics.current_bees.clone()))?;
        registry.register(Box::new(metrics.current_varroa.clone()))?;
        registry.register(Box::new(metrics.fps.clone()))?;
        registry.register(Box::new(metrics.infestation_ratio.clone()))?;
        registry.register(Box::new(metrics.risk_level.clone()))?;
        registry.register(Box::new(metrics.run_state.clone()))?;
        registry.register(Box::new(metrics.uptime_seconds.clone()))?;
        registry.register(Box::new(metrics.runs_started_total.clone()))?;
        registry.register(Box::new(metrics.launch_failures_total.clone()))?;
        registry.register(Box::new(metrics.lines_read_total.clone()))?;
        registry.register(Box::new(metrics.parse_skips_total.clone()))?;
        registry.register(Box::new(metrics.persist_failures_total.clone()))?;
        registry.register(Box::new(metrics.processes_reaped_total.clone()))?;

        Ok(metrics)
    }

    /// Copies the snapshot, run state and counters into the registered metrics.
    pub fn refresh(
        &self,
        stats: &DetectionStats,
        state: RunState,
        counters: &CountersSnapshot,
        uptime_seconds: f64,
    ) {
        self.frames_total.set(clamp_i64(stats.total_frames));
        self.unique_bees.set(clamp_i64(stats.unique_bees));
        self.unique_varroa.set(clamp_i64(stats.unique_varroa));
        self.current_bees.set(clamp_i64(stats.current_bees));
        self.current_varroa.set(clamp_i64(stats.current_varroa));
        self.fps.set(stats.fps);
        self.infestation_ratio.set(stats.infestation_ratio);
        self.risk_level.set(stats.infestation_risk_level as i64);
        self.run_state.set(state as i64);
        self.uptime_seconds.set(uptime_seconds);

        advance(&self.runs_started_total, counters.runs_started);
        advance(&self.launch_failures_total, counters.launch_failures);
        advance(&self.lines_read_total, counters.lines_read);
        advance(&self.parse_skips_total, counters.parse_skips);
        advance(&self.persist_failures_total, counters.persist_failures);
        advance(&self.processes_reaped_total, counters.processes_reaped);
    }
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Moves a counter forward to `target`; never backwards.
fn advance(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};
    use varroa_monitor::RiskLevel;

    #[test]
    fn test_refresh_and_encode() {
        let registry = Registry::new();
        let metrics = DetectionMetrics::new(&registry).unwrap();

        let stats = DetectionStats {
            total_frames: 120,
            unique_bees: 20,
            unique_varroa: 3,
            infestation_ratio: 0.15,
            infestation_risk_level: RiskLevel::Critical,
            ..Default::default()
        };
        let counters = CountersSnapshot {
            runs_started: 2,
            lines_read: 500,
            ..Default::default()
        };
        metrics.refresh(&stats, RunState::Running, &counters, 12.0);

        assert_eq!(metrics.risk_level.get(), 4);
        assert_eq!(metrics.run_state.get(), 2);
        assert_eq!(metrics.lines_read_total.get(), 500);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("varroa_frames_total 120"));
        assert!(text.contains("varroa_monitor_runs_started_total 2"));
    }

    #[test]
    fn test_counters_never_move_backwards() {
        let registry = Registry::new();
        let metrics = DetectionMetrics::new(&registry).unwrap();
        let stats = DetectionStats::default();

        let mut counters = CountersSnapshot {
            lines_read: 10,
            ..Default::default()
        };
        metrics.refresh(&stats, RunState::Idle, &counters, 0.0);
        counters.lines_read = 4;
        metrics.refresh(&stats, RunState::Idle, &counters, 0.0);
        assert_eq!(metrics.lines_read_total.get(), 10);
    }
}

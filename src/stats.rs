//! Running detection statistics.
//!
//! [`StatsAggregator`] folds parsed pipeline events into a [`DetectionStats`]
//! snapshot and a bounded [`TimeSeries`]. It is driven by the read loop only;
//! everyone else reads copies through [`SharedStats`].

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::StatsConfig;
use crate::parser::{self, ParsedEvent};
use crate::timeseries::{Sample, TimeSeries, TimeSeriesSnapshot};

/// Upper bounds (exclusive) of the Low, Moderate and High bands.
pub const RISK_LOW_BELOW: f64 = 0.05;
pub const RISK_MODERATE_BELOW: f64 = 0.10;
pub const RISK_HIGH_BELOW: f64 = 0.15;

/// Coarse classification of the infestation ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    #[default]
    Unknown,
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    /// A ratio exactly on a threshold falls into the higher band.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < RISK_LOW_BELOW {
            RiskLevel::Low
        } else if ratio < RISK_MODERATE_BELOW {
            RiskLevel::Moderate
        } else if ratio < RISK_HIGH_BELOW {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    /// Numeric encoding used by the Prometheus gauge.
    pub fn as_gauge(self) -> f64 {
        self as u8 as f64
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Unknown => "Unknown",
            RiskLevel::Low => "Low",
            RiskLevel::Moderate => "Moderate",
            RiskLevel::High => "High",
            RiskLevel::Critical => "Critical",
        };
        f.write_str(s)
    }
}

/// `unique_varroa / unique_bees`, or 0 when no bees were seen.
pub fn infestation_ratio(unique_bees: u64, unique_varroa: u64) -> f64 {
    if unique_bees == 0 {
        0.0
    } else {
        unique_varroa as f64 / unique_bees as f64
    }
}

/// Statistics of the current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub total_frames: u64,
    /// Mirrors `unique_bees`.
    pub total_bees: u64,
    /// Mirrors `unique_varroa`.
    pub total_varroa: u64,
    pub unique_bees: u64,
    pub unique_varroa: u64,
    pub current_bees: u64,
    pub current_varroa: u64,
    pub fps: f64,
    pub infestation_ratio: f64,
    pub infestation_risk_level: RiskLevel,
}

/// Values handed to the persistence collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PersistRequest {
    pub unique_bees: u64,
    pub unique_varroa: u64,
    pub frame_count: u64,
    pub fps: f64,
}

/// What applying one line produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineEffect {
    pub persist: Vec<PersistRequest>,
    /// Markers found with an unreadable value.
    pub skipped: usize,
}

/// How often derived work happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsCadence {
    pub time_series_capacity: usize,
    pub sample_every_frames: u64,
    pub persist_every_frames: u64,
    pub fps_min_interval: Duration,
}

impl Default for StatsCadence {
    fn default() -> Self {
        Self::from(&StatsConfig::default())
    }
}

impl From<&StatsConfig> for StatsCadence {
    fn from(cfg: &StatsConfig) -> Self {
        Self {
            time_series_capacity: cfg.time_series_capacity,
            sample_every_frames: cfg.sample_every_frames.max(1),
            persist_every_frames: cfg.persist_every_frames.max(1),
            fps_min_interval: Duration::from_millis(cfg.fps_min_interval_ms),
        }
    }
}

pub struct StatsAggregator {
    stats: DetectionStats,
    series: TimeSeries,
    cadence: StatsCadence,
    // FPS bookkeeping
    last_update: Instant,
    last_frame: u64,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(StatsCadence::default())
    }
}

impl StatsAggregator {
    pub fn new(cadence: StatsCadence) -> Self {
        Self {
            stats: DetectionStats::default(),
            series: TimeSeries::new(cadence.time_series_capacity),
            cadence,
            last_update: Instant::now(),
            last_frame: 0,
        }
    }

    /// Back to zeros / Unknown with an empty series, as at the start of a run.
    pub fn reset(&mut self) {
        self.stats = DetectionStats::default();
        self.series.clear();
        self.last_update = Instant::now();
        self.last_frame = 0;
    }

    pub fn stats(&self) -> &DetectionStats {
        &self.stats
    }

    pub fn series(&self) -> &TimeSeries {
        &self.series
    }

    /// Applies one event using the current clocks.
    pub fn apply(&mut self, event: ParsedEvent) -> Option<PersistRequest> {
        self.apply_at(event, Instant::now(), Local::now())
    }

    /// Applies one event at the given instant; `wall` labels any sample taken.
    pub fn apply_at(
        &mut self,
        event: ParsedEvent,
        now: Instant,
        wall: DateTime<Local>,
    ) -> Option<PersistRequest> {
        match event {
            ParsedEvent::UniqueBees(n) => {
                self.stats.unique_bees = n;
                self.stats.total_bees = n;
                self.refresh_ratio();
                None
            }
            ParsedEvent::UniqueVarroa(n) => {
                self.stats.unique_varroa = n;
                self.stats.total_varroa = n;
                self.refresh_ratio();
                None
            }
            ParsedEvent::CurrentBees(n) => {
                self.stats.current_bees = n;
                None
            }
            ParsedEvent::CurrentVarroa(n) => {
                self.stats.current_varroa = n;
                None
            }
            ParsedEvent::FrameCount(n) => self.on_frame(n, now, wall),
        }
    }

    /// Parses `line` and applies every event on it.
    pub fn apply_line(&mut self, line: &str) -> LineEffect {
        let outcome = parser::parse_line(line);
        for skip in &outcome.skipped {
            warn!("{}", skip);
        }
        LineEffect {
            persist: outcome
                .events
                .into_iter()
                .filter_map(|event| self.apply(event))
                .collect(),
            skipped: outcome.skipped.len(),
        }
    }

    fn on_frame(&mut self, frame: u64, now: Instant, wall: DateTime<Local>) -> Option<PersistRequest> {
        self.stats.total_frames = frame;

        let elapsed = now.saturating_duration_since(self.last_update);
        if frame > self.last_frame && elapsed > self.cadence.fps_min_interval {
            let frame_diff = frame - self.last_frame;
            self.stats.fps = frame_diff as f64 / elapsed.as_secs_f64();
            self.last_frame = frame;
            self.last_update = now;
        }

        if frame % self.cadence.sample_every_frames == 0 {
            self.refresh_ratio();
            self.series.push(Sample {
                timestamp: wall.format("%H:%M:%S").to_string(),
                bees: self.stats.current_bees,
                varroa: self.stats.current_varroa,
                infestation_ratio: self.stats.infestation_ratio,
            });
        }

        if self.stats.total_frames % self.cadence.persist_every_frames == 0 {
            return Some(PersistRequest {
                unique_bees: self.stats.unique_bees,
                unique_varroa: self.stats.unique_varroa,
                frame_count: self.stats.total_frames,
                fps: self.stats.fps,
            });
        }
        None
    }

    fn refresh_ratio(&mut self) {
        let ratio = infestation_ratio(self.stats.unique_bees, self.stats.unique_varroa);
        self.stats.infestation_ratio = ratio;
        self.stats.infestation_risk_level = RiskLevel::from_ratio(ratio);
    }
}

/// Thread-safe handle to one aggregator.
///
/// Every read takes the lock once and copies, so readers never see a
/// half-applied event.
#[derive(Clone)]
pub struct SharedStats {
    inner: Arc<Mutex<StatsAggregator>>,
}

impl SharedStats {
    pub fn new(cadence: StatsCadence) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatsAggregator::new(cadence))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatsAggregator> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> DetectionStats {
        self.lock().stats().clone()
    }

    pub fn time_series(&self) -> TimeSeriesSnapshot {
        self.lock().series().snapshot()
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Applies every event on `line` under a single lock.
    pub fn apply_line(&self, line: &str) -> LineEffect {
        self.lock().apply_line(line)
    }
}

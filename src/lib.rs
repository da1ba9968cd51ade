//! Varroa Monitor Library
//!
//! This library supervises an external bee / varroa detection pipeline. It
//! launches the pipeline as a child process, turns its line-oriented stdout
//! into running statistics and tears the child (and anything it left behind)
//! down reliably, however the run ends.
//!
//! # Features
//!
//! - **Run Control**: One run at a time, with `start` / `stop` reporting coarse status
//! - **Escalating Stop**: Interrupt, then terminate, then kill, each with a bounded wait
//! - **Resource Reaping**: Orphaned pipeline processes and SysV IPC objects are cleaned up
//! - **Statistics**: Frame rate, unique counts, infestation ratio and risk level
//! - **Time Series**: Bounded history sampled every few frames
//! - **Sessions**: Periodic snapshots handed to a pluggable [`MetricsStore`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use varroa_monitor::{Config, MemoryStore, StartStatus, Supervisor};
//!
//! let config = Config::default();
//! let supervisor = Supervisor::new(&config, Arc::new(MemoryStore::default()));
//!
//! if let Ok(StartStatus::Started) = supervisor.start() {
//!     let stats = supervisor.stats();
//!     println!("{} frames, risk {}", stats.total_frames, stats.infestation_risk_level);
//!     supervisor.stop();
//! }
//! ```

pub mod config;
pub mod error;
pub mod parser;
pub mod process;
pub mod ringbuffer;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod timeseries;

// Re-export main types for convenience
pub use config::{Config, ConfigFormat};
pub use error::{LaunchError, ParseSkip, StoreError, SupervisorError};
pub use parser::ParsedEvent;
pub use stats::{DetectionStats, RiskLevel, StatsAggregator};
pub use store::{JsonlStore, MemoryStore, MetricsStore, SessionId};
pub use supervisor::{RunState, StartStatus, StopStatus, Supervisor};
pub use timeseries::{TimeSeries, TimeSeriesSnapshot};

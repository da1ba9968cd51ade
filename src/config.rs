//! Configuration management for varroa-monitor.
//!
//! This module handles loading and validating configuration from files.
//! It supports YAML, JSON, and TOML formats. CLI overrides are merged by the
//! binary on top of the loaded file.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

// Default configuration constants
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_COMMAND: &str = "python3 detection.py -i /dev/video0 \
    --hef first_15k.hef --labels-json labels.json";
pub const DEFAULT_DISPLAY: &str = ":0";
pub const DEFAULT_SESSION_NOTES: &str = "Automatic detection";
pub const DEFAULT_SESSION_SOURCE: &str = "default";

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Configuration format options for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// How the pipeline child is launched and read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_command")]
    pub command: String,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// DISPLAY to set when neither the overlay nor the inherited env has one
    #[serde(default = "default_display")]
    pub display: Option<String>,

    /// Session source label; derived from the command when absent
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default = "default_session_notes")]
    pub session_notes: String,

    /// Bounded wait for one stdout line (ms)
    #[serde(default = "default_read_poll_ms")]
    pub read_poll_ms: u64,

    /// Sleep after an empty read while the child is alive (ms)
    #[serde(default = "default_eof_backoff_ms")]
    pub eof_backoff_ms: u64,

    /// Environment overlay on top of the inherited environment
    // Kept last: TOML emits tables after plain values.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_command() -> String {
    DEFAULT_COMMAND.to_string()
}
fn default_display() -> Option<String> {
    Some(DEFAULT_DISPLAY.to_string())
}
fn default_session_notes() -> String {
    DEFAULT_SESSION_NOTES.to_string()
}
fn default_read_poll_ms() -> u64 {
    100
}
fn default_eof_backoff_ms() -> u64 {
    100
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            working_dir: None,
            display: default_display(),
            source: None,
            session_notes: default_session_notes(),
            read_poll_ms: default_read_poll_ms(),
            eof_backoff_ms: default_eof_backoff_ms(),
            env: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Source label for new sessions.
    pub fn session_source(&self) -> String {
        self.source
            .clone()
            .unwrap_or_else(|| session_source(&self.command))
    }
}

/// Extracts the value of `-i`/`--input` from a command line.
///
/// Falls back to [`DEFAULT_SESSION_SOURCE`].
pub fn session_source(command: &str) -> String {
    let mut tokens = command.split_whitespace();
    while let Some(token) = tokens.next() {
        if let Some(value) = token.strip_prefix("--input=") {
            return value.to_string();
        }
        if token == "-i" || token == "--input" {
            if let Some(value) = tokens.next() {
                return value.to_string();
            }
        }
    }
    DEFAULT_SESSION_SOURCE.to_string()
}

/// Escalating stop deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationConfig {
    #[serde(default = "default_interrupt_wait_ms")]
    pub interrupt_wait_ms: u64,
    #[serde(default = "default_terminate_wait_ms")]
    pub terminate_wait_ms: u64,
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound for stop() waiting on the read loop
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_interrupt_wait_ms() -> u64 {
    2000
}
fn default_terminate_wait_ms() -> u64 {
    1000
}
fn default_kill_wait_ms() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_stop_timeout_ms() -> u64 {
    10000
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            interrupt_wait_ms: default_interrupt_wait_ms(),
            terminate_wait_ms: default_terminate_wait_ms(),
            kill_wait_ms: default_kill_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl TerminationConfig {
    /// Worst case of the interrupt/terminate/kill escalation (ms).
    pub fn escalation_budget_ms(&self) -> u64 {
        self.interrupt_wait_ms
            .saturating_add(self.terminate_wait_ms)
            .saturating_add(self.kill_wait_ms)
    }
}

/// Orphan cleanup patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Matched against the short process name
    #[serde(default = "default_process_names")]
    pub process_names: Vec<String>,

    /// Matched against the full command line
    #[serde(default = "default_command_substrings")]
    pub command_substrings: Vec<String>,

    /// Wait between interrupt and kill (ms)
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Remove orphaned SysV shared memory and semaphores
    #[serde(default = "default_true")]
    pub purge_ipc: bool,

    #[serde(default = "default_true")]
    pub reap_on_startup: bool,
}

fn default_process_names() -> Vec<String> {
    vec!["gst-launch".into()]
}
fn default_command_substrings() -> Vec<String> {
    [
        "detection.py",
        "GStreamerDetectionApp",
        "hailonet",
        "hailotracker",
        "hailofilter",
        "hailooverlay",
        "autovideosink",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_grace_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            process_names: default_process_names(),
            command_substrings: default_command_substrings(),
            grace_ms: default_grace_ms(),
            purge_ipc: true,
            reap_on_startup: true,
        }
    }
}

impl ReaperConfig {
    /// Worst case of one sweep: a grace period per pattern with matches (ms).
    pub fn sweep_budget_ms(&self) -> u64 {
        let patterns = (self.process_names.len() + self.command_substrings.len()) as u64;
        self.grace_ms.saturating_mul(patterns)
    }

    /// No patterns, no IPC purge. Sweeps become no-ops.
    pub fn disabled() -> Self {
        Self {
            process_names: Vec::new(),
            command_substrings: Vec::new(),
            grace_ms: 0,
            purge_ipc: false,
            reap_on_startup: false,
        }
    }
}

/// Sampling and persistence cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_time_series_capacity")]
    pub time_series_capacity: usize,
    #[serde(default = "default_sample_every_frames")]
    pub sample_every_frames: u64,
    #[serde(default = "default_persist_every_frames")]
    pub persist_every_frames: u64,
    #[serde(default = "default_fps_min_interval_ms")]
    pub fps_min_interval_ms: u64,
}

fn default_time_series_capacity() -> usize {
    crate::timeseries::DEFAULT_CAPACITY
}
fn default_sample_every_frames() -> u64 {
    10
}
fn default_persist_every_frames() -> u64 {
    100
}
fn default_fps_min_interval_ms() -> u64 {
    500
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            time_series_capacity: default_time_series_capacity(),
            sample_every_frames: default_sample_every_frames(),
            persist_every_frames: default_persist_every_frames(),
            fps_min_interval_ms: default_fps_min_interval_ms(),
        }
    }
}

/// Session and metric storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON-lines journal; in-memory only when unset
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_metrics")]
    pub max_metrics: usize,
}

fn default_max_metrics() -> usize {
    10_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_metrics: default_max_metrics(),
        }
    }
}

/// Effective configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,

    // Logging
    pub log_level: Option<String>,

    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub termination: TerminationConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            port: Some(DEFAULT_PORT),
            log_level: Some("info".into()),
            pipeline: PipelineConfig::default(),
            termination: TerminationConfig::default(),
            reaper: ReaperConfig::default(),
            stats: StatsConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if cfg.pipeline.command.trim().is_empty() {
        return Err("pipeline.command must not be empty".into());
    }

    if let Some(dir) = &cfg.pipeline.working_dir {
        if !dir.is_dir() {
            return Err(format!(
                "pipeline.working_dir is not a directory: {}",
                dir.display()
            )
            .into());
        }
    }

    if cfg.pipeline.read_poll_ms == 0 {
        return Err("pipeline.read_poll_ms must be greater than 0".into());
    }
    if cfg.termination.poll_interval_ms == 0 {
        return Err("termination.poll_interval_ms must be greater than 0".into());
    }

    // stop() must outlast a full teardown of the read loop
    let teardown_ms = cfg
        .termination
        .escalation_budget_ms()
        .saturating_add(cfg.reaper.sweep_budget_ms());
    if cfg.termination.stop_timeout_ms < teardown_ms {
        return Err(format!(
            "termination.stop_timeout_ms ({}) is shorter than the teardown budget ({} ms: \
             interrupt + terminate + kill waits plus reaper.grace_ms per pattern)",
            cfg.termination.stop_timeout_ms, teardown_ms
        )
        .into());
    }

    if cfg.stats.time_series_capacity == 0 {
        return Err("stats.time_series_capacity must be greater than 0".into());
    }
    if cfg.stats.sample_every_frames == 0 || cfg.stats.persist_every_frames == 0 {
        return Err(
            "stats.sample_every_frames and stats.persist_every_frames must be greater than 0"
                .into(),
        );
    }

    if cfg.store.max_metrics == 0 {
        return Err("store.max_metrics must be greater than 0".into());
    }

    if let Some(level) = cfg.log_level.as_deref() {
        if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}', expected one of {}",
                level,
                LOG_LEVELS.join("/")
            )
            .into());
        }
    }

    Ok(())
}

/// Loads configuration from `path`, or from the first existing default location.
///
/// A missing file yields the built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let defaults = [
                "/etc/varroa-monitor/config.yaml",
                "./varroa-monitor.yaml",
                "./varroa-monitor.json",
                "./varroa-monitor.toml",
            ];

            match defaults.iter().find(|p| Path::new(p).exists()) {
                Some(p) => PathBuf::from(p),
                None => return Ok(Config::default()),
            }
        }
    };

    if !path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path)?;
    let config = parse_config(&content, format_for_path(&path))?;
    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

/// Format implied by a file extension; YAML when unknown.
pub fn format_for_path(path: &Path) -> ConfigFormat {
    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => ConfigFormat::Json,
        Some("toml") => ConfigFormat::Toml,
        _ => ConfigFormat::Yaml,
    }
}

pub fn parse_config(
    content: &str,
    format: ConfigFormat,
) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match format {
        ConfigFormat::Json => serde_json::from_str(content)?,
        ConfigFormat::Toml => toml::from_str(content)?,
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
    };
    Ok(config)
}

pub fn render_config(
    config: &Config,
    format: ConfigFormat,
) -> Result<String, Box<dyn std::error::Error>> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };
    Ok(output)
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", render_config(config, format)?);
    Ok(())
}

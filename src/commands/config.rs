//! Config command implementation.
//!
//! Generates configuration files in various formats.

use std::fs;
use std::path::PathBuf;
use varroa_monitor::config::render_config;
use varroa_monitor::{Config, ConfigFormat};

/// Generates configuration files.
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> anyhow::Result<()> {
    let config = Config::default();
    let output = match output {
        Some(path) => path,
        None => PathBuf::from(match format {
            ConfigFormat::Yaml => "varroa-monitor.yaml",
            ConfigFormat::Json => "varroa-monitor.json",
            ConfigFormat::Toml => "varroa-monitor.toml",
        }),
    };

    let mut content = render_config(&config, format).map_err(|e| anyhow::anyhow!("{e}"))?;
    if commented && format == ConfigFormat::Yaml {
        content = add_config_comments(content);
    }

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Adds comments to YAML configuration.
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# Varroa Monitor Configuration
# ============================
#
# Server
# ------
# bind: "0.0.0.0"               # Bind IP (0.0.0.0 = all interfaces)
# port: 5000                    # HTTP port
# log_level: "info"             # off, error, warn, info, debug, trace
#
# pipeline
# --------
# command: "python3 detection.py -i /dev/video0 ..."   # run through `sh -c exec`
# working_dir: null             # Working directory of the pipeline
# env: {}                       # Extra environment variables
# display: ":0"                 # DISPLAY when none is set
# source: null                  # Session source (default: value of -i/--input)
# session_notes: "Automatic detection"
# read_poll_ms: 100             # Bounded wait for one output line
# eof_backoff_ms: 100           # Retry delay once stdout closed
#
# termination
# -----------
# interrupt_wait_ms: 2000       # Wait after SIGINT
# terminate_wait_ms: 1000       # Wait after SIGTERM
# kill_wait_ms: 500             # Wait after SIGKILL
# poll_interval_ms: 50
# stop_timeout_ms: 10000        # Upper bound for a stop request, >= full teardown
#
# reaper
# ------
# process_names: [...]          # Matched against the process name
# command_substrings: [...]     # Matched against the full command line
# grace_ms: 500                 # Between SIGINT and SIGKILL
# purge_ipc: true               # Remove orphaned SysV shm/semaphores
# reap_on_startup: true
#
# stats
# -----
# time_series_capacity: 100
# sample_every_frames: 10
# persist_every_frames: 100
# fps_min_interval_ms: 500
#
# store
# -----
# path: null                    # JSON-lines journal (null = in memory)
# max_metrics: 10000
"#;

    format!("{comments}\n{yaml}")
}

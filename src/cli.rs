//! CLI arguments and subcommands for varroa-monitor.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;
use varroa_monitor::ConfigFormat;

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Output format for `replay`
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "varroa-monitor",
    about = "Supervisor and HTTP control surface for a bee / varroa detection pipeline",
    long_about = "Supervisor and HTTP control surface for a bee / varroa detection pipeline.\n\n\
                  Launches the detection pipeline as a child process, parses its status output \
                  into live statistics, records sessions and cleans up the pipeline and its \
                  leftover processes and IPC objects when a run ends.",
    version,
    propagate_version = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level (overrides log_level from the config file)
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Pipeline command line (overrides pipeline.command)
    #[arg(long)]
    pub pipeline_command: Option<String>,

    /// JSON-lines session store (overrides store.path)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Start a detection run as soon as the server is up
    #[arg(long)]
    pub autostart: bool,

    /// Skip the reaper sweep at startup
    #[arg(long)]
    pub no_startup_reap: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Kill leftover pipeline processes and purge orphaned IPC objects
    Reap {
        /// Only list what would be reaped
        #[arg(long)]
        dry_run: bool,
    },

    /// Feed a captured pipeline log through the parser and print the resulting stats
    Replay {
        /// Log file ("-" for stdin)
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: ReportFormat,
    },

    /// Emit synthetic pipeline output on stdout
    Simulate {
        /// Number of frames to emit
        #[arg(short = 'n', long, default_value = "1000")]
        frames: u64,

        /// Delay between frames in milliseconds
        #[arg(short, long, default_value = "33")]
        interval_ms: u64,

        /// Random seed for reproducible output
        #[arg(short, long)]
        seed: Option<u64>,
    },

    /// Generate configuration file
    Config {
        /// Output file ("-" for stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Config format
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments
        #[arg(long)]
        commented: bool,
    },
}

impl Args {
    /// Level string for the config file (`log_level`).
    pub fn log_level_name(&self) -> Option<&'static str> {
        self.log_level.map(|level| match level {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_flags() {
        let args = Args::parse_from([
            "varroa-monitor",
            "--port",
            "8080",
            "--autostart",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.port, Some(8080));
        assert!(args.autostart);
        assert_eq!(args.log_level_name(), Some("debug"));
        assert!(args.command.is_none());
    }

    #[test]
    fn test_simulate_defaults() {
        let args = Args::parse_from(["varroa-monitor", "simulate", "--seed", "7"]);
        match args.command {
            Some(Commands::Simulate {
                frames,
                interval_ms,
                seed,
            }) => {
                assert_eq!(frames, 1000);
                assert_eq!(interval_ms, 33);
                assert_eq!(seed, Some(7));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

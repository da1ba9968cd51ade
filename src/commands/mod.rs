//! CLI command implementations for varroa-monitor.
//!
//! This module provides implementations for all CLI subcommands:
//! - `reap`: One reaper sweep, or a dry run
//! - `replay`: Parse a captured pipeline log
//! - `simulate`: Synthetic pipeline output
//! - `config`: Configuration file generation

pub mod config;
pub mod reap;
pub mod replay;
pub mod simulate;

// Re-export command functions
pub use config::command_config;
pub use reap::command_reap;
pub use replay::command_replay;
pub use simulate::command_simulate;

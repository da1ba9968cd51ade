//! Process-related modules for launching, stopping and cleaning up after the pipeline.
//!
//! This module provides:
//! - `handle`: One pipeline invocation (spawn, line reads, escalating stop)
//! - `termination`: The interrupt/terminate/kill state machine
//! - `reaper`: Name/command based cleanup of orphaned processes
//! - `lister`: Process discovery from /proc
//! - `signal`: Signal delivery
//! - `ipc`: System V shared memory and semaphore cleanup

pub mod handle;
pub mod ipc;
pub mod lister;
pub mod reaper;
pub mod signal;
pub mod termination;

// Re-export commonly used types
pub use handle::{ChildHandle, LaunchSpec, ProcessHandle, ReadOutcome};
pub use ipc::IpcPurgeReport;
pub use lister::{ProcessInfo, ProcessLister, ProcfsLister, StaticLister};
pub use reaper::{ResourceReaper, SweepReport};
pub use signal::{NixSignaler, Signaler};
pub use termination::{
    terminate, ProcessControl, TerminationOutcome, TerminationPolicy, TerminationStage,
};

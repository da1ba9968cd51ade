//! Signal delivery behind a seam the reaper can be tested against.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Capability to signal arbitrary processes by pid.
pub trait Signaler: Send + Sync {
    /// Sends `signal` to `pid`. `Err(Errno::ESRCH)` means the process is gone.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno>;

    /// Liveness check (signal 0).
    fn is_alive(&self, pid: u32) -> bool;
}

/// Delivers real signals with `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NixSignaler;

impl Signaler for NixSignaler {
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno> {
        kill(Pid::from_raw(pid as i32), signal)
    }

    fn is_alive(&self, pid: u32) -> bool {
        match kill(Pid::from_raw(pid as i32), None::<Signal>) {
            Ok(()) => true,
            // Exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

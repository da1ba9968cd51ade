//! Best-effort cleanup of orphaned pipeline processes and IPC objects.
//!
//! A pipeline can fork helpers that outlive it (GStreamer elements, the
//! interpreter running the detection script) and can leave System V IPC
//! objects behind when it dies hard. The reaper finds such processes by name
//! or command-line substring, interrupts them, waits a short grace period and
//! kills whatever is left. Nothing here returns an error: failures are logged
//! and the sweep moves on.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::geteuid;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ReaperConfig;
use crate::process::ipc::{self, IpcPurgeReport};
use crate::process::lister::{ProcessInfo, ProcessLister, ProcfsLister};
use crate::process::signal::{NixSignaler, Signaler};

/// Totals for one full sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub matched_by_name: usize,
    pub matched_by_command: usize,
    pub ipc: IpcPurgeReport,
}

impl SweepReport {
    pub fn processes(&self) -> usize {
        self.matched_by_name + self.matched_by_command
    }
}

pub struct ResourceReaper {
    config: ReaperConfig,
    lister: Arc<dyn ProcessLister>,
    signaler: Arc<dyn Signaler>,
    ipc_root: PathBuf,
    self_pid: u32,
    reaped_total: AtomicU64,
}

impl ResourceReaper {
    /// Reaper over the real process table and real signals.
    pub fn new(config: ReaperConfig) -> Self {
        Self::with_backends(
            config,
            Arc::new(ProcfsLister::default()),
            Arc::new(NixSignaler),
        )
    }

    pub fn with_backends(
        config: ReaperConfig,
        lister: Arc<dyn ProcessLister>,
        signaler: Arc<dyn Signaler>,
    ) -> Self {
        Self {
            config,
            lister,
            signaler,
            ipc_root: PathBuf::from("/proc/sysvipc"),
            self_pid: std::process::id(),
            reaped_total: AtomicU64::new(0),
        }
    }

    /// Overrides the directory holding the `shm`/`sem` tables.
    pub fn with_ipc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.ipc_root = root.into();
        self
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Number of processes matched by every kill call so far.
    pub fn reaped_total(&self) -> u64 {
        self.reaped_total.load(Ordering::Relaxed)
    }

    /// Processes whose short name contains `name`.
    pub fn find_by_name(&self, name: &str) -> Vec<ProcessInfo> {
        if name.is_empty() {
            return Vec::new();
        }
        self.candidates(|p| p.name.contains(name))
    }

    /// Processes whose full command line contains `substring`.
    pub fn find_by_command_substring(&self, substring: &str) -> Vec<ProcessInfo> {
        if substring.is_empty() {
            return Vec::new();
        }
        self.candidates(|p| p.cmdline.contains(substring))
    }

    fn candidates(&self, matches: impl Fn(&ProcessInfo) -> bool) -> Vec<ProcessInfo> {
        self.lister
            .list()
            .into_iter()
            .filter(|p| p.pid != self.self_pid)
            .filter(|p| matches(p))
            .collect()
    }

    /// Interrupts, then kills, every process whose name contains `name`.
    /// Returns the number of processes matched.
    pub fn kill_by_name(&self, name: &str) -> usize {
        let found = self.find_by_name(name);
        if !found.is_empty() {
            info!("Reaping {} process(es) matching name '{}'", found.len(), name);
        }
        self.kill_all(&found)
    }

    /// Like [`kill_by_name`](Self::kill_by_name) but matches the full command line.
    pub fn kill_by_command_substring(&self, substring: &str) -> usize {
        let found = self.find_by_command_substring(substring);
        if !found.is_empty() {
            info!(
                "Reaping {} process(es) whose command contains '{}'",
                found.len(),
                substring
            );
        }
        self.kill_all(&found)
    }

    fn kill_all(&self, procs: &[ProcessInfo]) -> usize {
        if procs.is_empty() {
            return 0;
        }

        let mut interrupted = Vec::with_capacity(procs.len());
        for p in procs {
            match self.signaler.signal(p.pid, Signal::SIGINT) {
                Ok(()) => {
                    debug!("Sent SIGINT to {} ({})", p.pid, p.name);
                    interrupted.push(p.pid);
                }
                Err(Errno::ESRCH) => debug!("Process {} already gone", p.pid),
                Err(e) => {
                    warn!("Failed to interrupt {} ({}): {}", p.pid, p.name, e);
                    interrupted.push(p.pid);
                }
            }
        }

        if !interrupted.is_empty() {
            thread::sleep(Duration::from_millis(self.config.grace_ms));
        }

        for pid in interrupted {
            if !self.signaler.is_alive(pid) {
                continue;
            }
            match self.signaler.signal(pid, Signal::SIGKILL) {
                Ok(()) => info!("Process {} ignored SIGINT, sent SIGKILL", pid),
                Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill {}: {}", pid, e),
            }
        }

        self.reaped_total
            .fetch_add(procs.len() as u64, Ordering::Relaxed);
        procs.len()
    }

    /// Removes orphaned System V shared memory and semaphores of the current user.
    pub fn purge_shared_resources(&self) -> IpcPurgeReport {
        let report = ipc::purge_orphaned(&self.ipc_root, geteuid().as_raw());
        if report.shm_removed > 0 || report.sem_removed > 0 {
            info!(
                "Purged {} shared memory segment(s) and {} semaphore(s)",
                report.shm_removed, report.sem_removed
            );
        }
        report
    }

    /// Runs every configured name and substring match, then the IPC purge.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for name in &self.config.process_names {
            report.matched_by_name += self.kill_by_name(name);
        }
        for substring in &self.config.command_substrings {
            report.matched_by_command += self.kill_by_command_substring(substring);
        }
        if self.config.purge_ipc {
            report.ipc = self.purge_shared_resources();
        }
        debug!("Reaper sweep finished: {:?}", report);
        report
    }

    /// Everything a sweep would signal, without signaling anything.
    pub fn dry_run(&self) -> Vec<ProcessInfo> {
        let mut out: Vec<ProcessInfo> = Vec::new();
        let names = self.config.process_names.iter().map(|n| self.find_by_name(n));
        let commands = self
            .config
            .command_substrings
            .iter()
            .map(|s| self.find_by_command_substring(s));
        for p in names.chain(commands).flatten() {
            if !out.iter().any(|o| o.pid == p.pid) {
                out.push(p);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::lister::StaticLister;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records signals; pids in `stubborn` survive SIGINT, pids in `vanished` report ESRCH.
    #[derive(Default)]
    struct RecordingSignaler {
        sent: Mutex<Vec<(u32, Signal)>>,
        stubborn: HashSet<u32>,
        vanished: HashSet<u32>,
    }

    impl Signaler for RecordingSignaler {
        fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno> {
            if self.vanished.contains(&pid) {
                return Err(Errno::ESRCH);
            }
            self.sent.lock().unwrap().push((pid, signal));
            Ok(())
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.stubborn.contains(&pid)
        }
    }

    fn proc_info(pid: u32, name: &str, cmdline: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: name.into(),
            cmdline: cmdline.into(),
        }
    }

    fn table() -> Vec<ProcessInfo> {
        vec![
            proc_info(100, "python3", "python3 detection.py -i /dev/video0"),
            proc_info(101, "gst-launch-1.0", "gst-launch-1.0 v4l2src ! hailonet ! fakesink"),
            proc_info(102, "bash", "bash"),
            proc_info(std::process::id(), "varroa-monitor", "varroa-monitor detection.py"),
        ]
    }

    fn config() -> ReaperConfig {
        ReaperConfig {
            process_names: vec!["gst-launch".into()],
            command_substrings: vec!["detection.py".into(), "hailonet".into()],
            grace_ms: 1,
            purge_ipc: false,
            reap_on_startup: false,
        }
    }

    fn reaper(signaler: Arc<RecordingSignaler>) -> ResourceReaper {
        ResourceReaper::with_backends(config(), Arc::new(StaticLister::new(table())), signaler)
    }

    #[test]
    fn test_kill_by_name_matches_short_name() {
        let signaler = Arc::new(RecordingSignaler::default());
        let reaper = reaper(signaler.clone());

        assert_eq!(reaper.kill_by_name("gst-launch"), 1);
        let sent = signaler.sent.lock().unwrap();
        assert_eq!(*sent, vec![(101, Signal::SIGINT)]);
    }

    #[test]
    fn test_kill_by_command_excludes_self() {
        let signaler = Arc::new(RecordingSignaler::default());
        let reaper = reaper(signaler.clone());

        assert_eq!(reaper.kill_by_command_substring("detection.py"), 1);
        let sent = signaler.sent.lock().unwrap();
        assert!(sent.iter().all(|(pid, _)| *pid != std::process::id()));
    }

    #[test]
    fn test_stubborn_process_gets_sigkill() {
        let signaler = Arc::new(RecordingSignaler {
            stubborn: [101].into_iter().collect(),
            ..Default::default()
        });
        let reaper = reaper(signaler.clone());

        reaper.kill_by_name("gst-launch");
        let sent = signaler.sent.lock().unwrap();
        assert_eq!(*sent, vec![(101, Signal::SIGINT), (101, Signal::SIGKILL)]);
    }

    #[test]
    fn test_vanished_process_is_not_an_error() {
        let signaler = Arc::new(RecordingSignaler {
            vanished: [100].into_iter().collect(),
            ..Default::default()
        });
        let reaper = reaper(signaler.clone());

        assert_eq!(reaper.kill_by_command_substring("detection.py"), 1);
        assert!(signaler.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_empty_pattern_matches_nothing() {
        let signaler = Arc::new(RecordingSignaler::default());
        let reaper = reaper(signaler.clone());

        assert_eq!(reaper.kill_by_name(""), 0);
        assert_eq!(reaper.kill_by_command_substring(""), 0);
        assert!(signaler.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sweep_totals_and_dry_run() {
        let signaler = Arc::new(RecordingSignaler::default());
        let reaper = reaper(signaler.clone());

        let preview: Vec<u32> = reaper.dry_run().iter().map(|p| p.pid).collect();
        assert_eq!(preview, vec![101, 100]);
        assert!(signaler.sent.lock().unwrap().is_empty());

        let report = reaper.sweep();
        assert_eq!(report.matched_by_name, 1);
        // "detection.py" -> 100, "hailonet" -> 101
        assert_eq!(report.matched_by_command, 2);
        assert_eq!(report.processes(), 3);
        assert_eq!(reaper.reaped_total(), 3);
    }
}

//! Process discovery for the resource reaper.
//!
//! The reaper never talks to the OS process table directly; it goes through
//! [`ProcessLister`] so tests can hand it a fixed table. [`ProcfsLister`]
//! is the real implementation and scans numeric directories under /proc.

use std::fs;
use std::path::{Path, PathBuf};

/// One live process as seen by a lister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Short command name (`comm`, falling back to the basename of argv[0]).
    pub name: String,
    /// Full command line with arguments joined by single spaces.
    pub cmdline: String,
}

/// Capability to enumerate live processes.
pub trait ProcessLister: Send + Sync {
    fn list(&self) -> Vec<ProcessInfo>;
}

/// Lists processes by scanning a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsLister {
    root: PathBuf,
}

impl Default for ProcfsLister {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsLister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcessLister for ProcfsLister {
    fn list(&self) -> Vec<ProcessInfo> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot scan {}: {}", self.root.display(), e);
                return out;
            }
        };

        for entry in entries.flatten() {
            let p = entry.path();
            let pid: u32 = match p
                .file_name()
                .and_then(|s| s.to_str())
                .filter(|s| s.chars().all(|c| c.is_ascii_digit()))
                .and_then(|s| s.parse().ok())
            {
                Some(v) => v,
                None => continue,
            };

            // Processes can exit between read_dir and these reads
            let cmdline = read_cmdline(&p).unwrap_or_default();
            let name = match read_process_name(&p, &cmdline) {
                Some(n) => n,
                None => continue,
            };
            out.push(ProcessInfo { pid, name, cmdline });
        }
        out
    }
}

/// Reads `cmdline`, turning NUL separators into spaces.
fn read_cmdline(proc_path: &Path) -> Option<String> {
    let content = fs::read(proc_path.join("cmdline")).ok()?;
    let parts: Vec<String> = content
        .split(|&b| b == 0u8)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    Some(parts.join(" "))
}

/// Reads the process name from `comm` or extracts it from the command line.
fn read_process_name(proc_path: &Path, cmdline: &str) -> Option<String> {
    if let Ok(s) = fs::read_to_string(proc_path.join("comm")) {
        let t = s.trim();
        if !t.is_empty() {
            return Some(t.into());
        }
    }

    let argv0 = cmdline.split(' ').next().filter(|s| !s.is_empty())?;
    Path::new(argv0)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
}

/// A lister over a fixed table, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticLister {
    pub processes: Vec<ProcessInfo>,
}

impl StaticLister {
    pub fn new(processes: Vec<ProcessInfo>) -> Self {
        Self { processes }
    }
}

impl ProcessLister for StaticLister {
    fn list(&self) -> Vec<ProcessInfo> {
        self.processes.clone()
    }
}

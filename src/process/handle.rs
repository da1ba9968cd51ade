//! Lifecycle of one pipeline invocation.
//!
//! The pipeline runs through `sh -c "exec <command>"` in its own process
//! group. Stdout is read line by line on a dedicated thread and handed over a
//! channel, so [`ProcessHandle::read_line`] can wait with a timeout instead of
//! blocking on the pipe. Stderr is drained on a second thread into the log.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::PipelineConfig;
use crate::error::LaunchError;
use crate::process::reaper::ResourceReaper;
use crate::process::termination::{self, ProcessControl, TerminationOutcome, TerminationPolicy};

/// Lines buffered between the stdout reader thread and the read loop.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Environment variable a windowed pipeline needs.
pub const DISPLAY_VAR: &str = "DISPLAY";

/// Everything needed to launch the pipeline.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Value for `DISPLAY` when neither `env` nor the inherited environment has one.
    pub display: Option<String>,
}

impl From<&PipelineConfig> for LaunchSpec {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            working_dir: cfg.working_dir.clone(),
            env: cfg.env.clone(),
            display: cfg.display.clone(),
        }
    }
}

impl LaunchSpec {
    /// Variables to set on the child on top of the inherited environment.
    pub fn env_overlay(&self, inherited_display: Option<&str>) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        let has_display = env.contains_key(DISPLAY_VAR)
            || inherited_display.is_some_and(|d| !d.is_empty());
        if !has_display {
            if let Some(display) = &self.display {
                env.insert(DISPLAY_VAR.to_string(), display.clone());
            }
        }
        env
    }
}

/// Result of a single [`ProcessHandle::read_line`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    /// Nothing arrived within the timeout.
    WouldBlock,
    /// Stdout is closed.
    Eof,
}

enum StreamEvent {
    Line(String),
    Failed(io::Error),
}

/// `ProcessControl` over a spawned child that leads its own process group.
struct ChildControl {
    child: Child,
    exited: bool,
}

impl ProcessControl for ChildControl {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn signal(&mut self, signal: Signal) -> Result<(), Errno> {
        if self.exited {
            return Err(Errno::ESRCH);
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        match killpg(pid, signal) {
            Err(Errno::ESRCH) => kill(pid, signal),
            other => other,
        }
    }

    fn has_exited(&mut self) -> bool {
        if self.exited {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Pipeline {} exited with {}", self.child.id(), status);
                self.exited = true;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Cannot query pipeline {}: {}", self.child.id(), e);
                self.exited = true;
            }
        }
        self.exited
    }
}

impl ChildControl {
    /// Blocks until the child is reaped.
    fn reap(&mut self) {
        if !self.exited {
            let _ = self.child.wait();
            self.exited = true;
        }
    }
}

/// Shared access to the pipeline child.
///
/// The read loop escalates through one clone while the supervisor keeps
/// another, so a stop that outlives its deadline can still kill and reap the
/// child itself. The lock is only held for a single signal or wait check.
#[derive(Clone)]
pub struct ChildHandle {
    inner: Arc<Mutex<ChildControl>>,
    pid: u32,
}

impl ChildHandle {
    fn lock(&self) -> MutexGuard<'_, ChildControl> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the child has exited and been reaped.
    pub fn has_exited(&self) -> bool {
        self.lock().has_exited()
    }

    /// SIGKILLs the whole process group and waits up to `wait` for the
    /// leader to be reaped. Returns whether it is confirmed gone.
    pub fn kill_group(&self, wait: Duration, poll: Duration) -> bool {
        let pgid = Pid::from_raw(self.pid as i32);
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => info!("Sent SIGKILL to process group {}", pgid),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
        }

        let deadline = Instant::now() + wait;
        loop {
            if self.has_exited() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(poll);
        }
    }
}

impl ProcessControl for ChildHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&mut self, signal: Signal) -> Result<(), Errno> {
        self.lock().signal(signal)
    }

    fn has_exited(&mut self) -> bool {
        self.lock().has_exited()
    }
}

/// One running (or finished) pipeline process.
pub struct ProcessHandle {
    control: ChildHandle,
    lines: Receiver<StreamEvent>,
    reaper: Arc<ResourceReaper>,
    policy: TerminationPolicy,
    termination: Option<TerminationOutcome>,
}

impl ProcessHandle {
    /// Launches the pipeline with stdout and stderr captured.
    pub fn start(
        spec: &LaunchSpec,
        reaper: Arc<ResourceReaper>,
        policy: TerminationPolicy,
    ) -> Result<Self, LaunchError> {
        let command = spec.command.trim();
        if command.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }

        let inherited_display = std::env::var(DISPLAY_VAR).ok();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec {command}"))
            .envs(spec.env_overlay(inherited_display.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id();

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            (out, _) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LaunchError::MissingPipe {
                    stream: if out.is_none() { "stdout" } else { "stderr" },
                });
            }
        };

        let (tx, rx) = mpsc::sync_channel(LINE_CHANNEL_CAPACITY);
        spawn_thread(format!("pipeline-stdout-{pid}"), move || {
            read_stdout(stdout, tx)
        });
        spawn_thread(format!("pipeline-stderr-{pid}"), move || {
            drain_stderr(stderr, pid)
        });

        info!("Started pipeline (pid {}): {}", pid, command);
        Ok(Self {
            control: ChildHandle {
                inner: Arc::new(Mutex::new(ChildControl {
                    child,
                    exited: false,
                })),
                pid,
            },
            lines: rx,
            reaper,
            policy,
            termination: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.control.pid()
    }

    /// Second handle on the child for stopping it from another thread.
    pub fn child(&self) -> ChildHandle {
        self.control.clone()
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        !self.control.has_exited()
    }

    /// Waits up to `timeout` for the next stdout line.
    ///
    /// An `Err` means the stream failed, which callers treat like process exit.
    pub fn read_line(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        match self.lines.recv_timeout(timeout) {
            Ok(StreamEvent::Line(line)) => Ok(ReadOutcome::Line(line)),
            Ok(StreamEvent::Failed(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(ReadOutcome::WouldBlock),
            Err(RecvTimeoutError::Disconnected) => Ok(ReadOutcome::Eof),
        }
    }

    /// Stops the pipeline (interrupt, terminate, kill) and sweeps leftovers.
    ///
    /// Only the first call does any work; later calls return the first outcome.
    pub fn terminate(&mut self) -> TerminationOutcome {
        if let Some(outcome) = self.termination {
            return outcome;
        }
        let outcome = self.stop_process();
        let report = self.reaper.sweep();
        info!(
            "Pipeline {} stopped ({:?}, exited: {}, swept {} process(es))",
            self.pid(),
            outcome.escalated_to,
            outcome.exited,
            report.processes()
        );
        outcome
    }

    /// Escalating stop of this pipeline's process group only, without a sweep.
    ///
    /// Used when the sweep patterns could match a newer pipeline.
    pub fn stop_process(&mut self) -> TerminationOutcome {
        if let Some(outcome) = self.termination {
            return outcome;
        }

        let outcome = termination::terminate(&mut self.control, &self.policy);
        let pgid = Pid::from_raw(self.control.pid() as i32);
        // Group members can outlive the leader
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => debug!("Killed stragglers in process group {}", pgid),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
        }

        self.termination = Some(outcome);
        outcome
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.termination.is_none() && !self.control.has_exited() {
            warn!("Pipeline {} dropped while running, killing it", self.pid());
            let mut control = self.control.lock();
            let _ = control.signal(Signal::SIGKILL);
            control.reap();
        }
    }
}

fn spawn_thread(name: String, f: impl FnOnce() + Send + 'static) {
    if let Err(e) = thread::Builder::new().name(name.clone()).spawn(f) {
        warn!("Failed to spawn {} thread: {}", name, e);
    }
}

fn read_stdout(stdout: impl Read, tx: SyncSender<StreamEvent>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                trace!(target: "pipeline::stdout", "{}", line);
                if tx.send(StreamEvent::Line(line)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(StreamEvent::Failed(e));
                break;
            }
        }
    }
}

fn drain_stderr(stderr: impl Read, pid: u32) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if !line.trim().is_empty() => {
                debug!(target: "pipeline::stderr", "[{}] {}", pid, line.trim_end())
            }
            Ok(_) => {}
            Err(e) => {
                debug!(target: "pipeline::stderr", "[{}] stderr closed: {}", pid, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaperConfig;
    use std::time::Instant;

    fn quiet_reaper() -> Arc<ResourceReaper> {
        Arc::new(ResourceReaper::new(ReaperConfig::disabled()))
    }

    fn spec(command: &str) -> LaunchSpec {
        LaunchSpec {
            command: command.into(),
            ..Default::default()
        }
    }

    fn fast_policy() -> TerminationPolicy {
        TerminationPolicy {
            interrupt_wait: Duration::from_millis(300),
            terminate_wait: Duration::from_millis(200),
            kill_wait: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn read_all(handle: &mut ProcessHandle) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut lines = Vec::new();
        while Instant::now() < deadline {
            match handle.read_line(Duration::from_millis(50)).unwrap() {
                ReadOutcome::Line(l) => lines.push(l),
                ReadOutcome::WouldBlock => {}
                ReadOutcome::Eof => break,
            }
        }
        lines
    }

    #[test]
    fn test_env_overlay_sets_display_when_missing() {
        let mut s = spec("true");
        s.display = Some(":0".into());

        assert_eq!(s.env_overlay(None).get(DISPLAY_VAR).map(String::as_str), Some(":0"));
        assert!(s.env_overlay(Some(":1")).get(DISPLAY_VAR).is_none());

        s.env.insert(DISPLAY_VAR.into(), ":5".into());
        assert_eq!(s.env_overlay(None).get(DISPLAY_VAR).map(String::as_str), Some(":5"));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let err = ProcessHandle::start(&spec("   "), quiet_reaper(), fast_policy()).err();
        assert!(matches!(err, Some(LaunchError::EmptyCommand)));
    }

    #[test]
    fn test_reads_stdout_lines_then_eof() {
        let mut handle = ProcessHandle::start(
            &spec("printf 'Frame count: 1\\n\\nUnique bees: 3\\n'"),
            quiet_reaper(),
            fast_policy(),
        )
        .unwrap();

        assert_eq!(read_all(&mut handle), vec!["Frame count: 1", "Unique bees: 3"]);
        let outcome = handle.terminate();
        assert!(outcome.exited);
    }

    #[test]
    fn test_stderr_is_not_mixed_into_stdout() {
        let mut handle = ProcessHandle::start(
            &spec("sh -c 'echo out; echo err 1>&2'"),
            quiet_reaper(),
            fast_policy(),
        )
        .unwrap();

        assert_eq!(read_all(&mut handle), vec!["out"]);
    }

    #[test]
    fn test_working_dir_and_env_are_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = spec("sh -c 'pwd; echo $HIVE_ID'");
        s.working_dir = Some(tmp.path().to_path_buf());
        s.env.insert("HIVE_ID".into(), "hive-7".into());

        let mut handle = ProcessHandle::start(&s, quiet_reaper(), fast_policy()).unwrap();
        let lines = read_all(&mut handle);
        let expected_dir = tmp.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(&lines[0]).canonicalize().unwrap(), expected_dir);
        assert_eq!(lines[1], "hive-7");
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut handle =
            ProcessHandle::start(&spec("sleep 30"), quiet_reaper(), fast_policy()).unwrap();
        assert!(handle.is_alive());

        let first = handle.terminate();
        assert!(first.exited);
        assert!(!handle.is_alive());

        let second = handle.terminate();
        assert_eq!(first, second);
    }

    #[test]
    fn test_interrupt_ignoring_child_is_killed() {
        let mut handle = ProcessHandle::start(
            &spec("sh -c 'trap \"\" INT TERM; while true; do sleep 0.05; done'"),
            quiet_reaper(),
            fast_policy(),
        )
        .unwrap();
        // Let the shell install its traps
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        let outcome = handle.terminate();
        assert!(outcome.exited);
        assert_eq!(
            outcome.escalated_to,
            termination::TerminationStage::KillSent
        );
        assert!(started.elapsed() < fast_policy().total_budget() + Duration::from_millis(500));
    }

    #[test]
    fn test_child_handle_kills_group_from_another_thread() {
        let mut handle = ProcessHandle::start(
            &spec("sh -c 'trap \"\" INT TERM; while true; do sleep 0.05; done'"),
            quiet_reaper(),
            fast_policy(),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));

        let child = handle.child();
        let killer = thread::spawn(move || {
            child.kill_group(Duration::from_secs(2), Duration::from_millis(10))
        });
        assert!(killer.join().unwrap());
        assert!(!handle.is_alive());

        // The escalation sees the reaped child and sends nothing
        let outcome = handle.stop_process();
        assert!(outcome.exited);
        assert_eq!(outcome.escalated_to, termination::TerminationStage::Running);
    }
}

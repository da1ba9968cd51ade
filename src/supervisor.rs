//! Run control for the detection pipeline.
//!
//! A [`Supervisor`] owns at most one active run. `start()` launches the
//! pipeline and spawns a read-loop thread that feeds stdout through the parser
//! into the shared [`StatsAggregator`](crate::stats::StatsAggregator). The loop
//! ends on `stop()`, on pipeline exit or on a read failure, and always finishes
//! with the same teardown: close the session, stop the process, sweep
//! leftovers, return to [`RunState::Idle`].
//!
//! Start and stop are serialized by a control mutex. Readers of stats and the
//! time series never take it. A loop only changes the run state or sweeps
//! while holding the transition lock and while its generation is current, so
//! a loop that `stop()` gave up on cannot touch a later run.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SupervisorError;
use crate::process::{
    ChildHandle, LaunchSpec, ProcessHandle, ReadOutcome, ResourceReaper, TerminationPolicy,
};
use crate::stats::{DetectionStats, SharedStats, StatsCadence};
use crate::store::{MetricsStore, SessionId};
use crate::timeseries::TimeSeriesSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Starting,
            2 => RunState::Running,
            3 => RunState::Stopping,
            _ => RunState::Idle,
        }
    }

    /// Starting, Running or Stopping.
    pub fn is_active(self) -> bool {
        self != RunState::Idle
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    AlreadyStopped,
}

/// Run parameters derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub launch: LaunchSpec,
    pub policy: TerminationPolicy,
    pub cadence: StatsCadence,
    pub session_source: String,
    pub session_notes: String,
    /// Bounded wait for one stdout line
    pub read_poll: Duration,
    /// Sleep between liveness checks once stdout is closed
    pub eof_backoff: Duration,
    /// How long `stop()` waits for the read loop to finish teardown
    pub stop_timeout: Duration,
}

impl From<&Config> for SupervisorOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            launch: LaunchSpec::from(&cfg.pipeline),
            policy: TerminationPolicy::from(&cfg.termination),
            cadence: StatsCadence::from(&cfg.stats),
            session_source: cfg.pipeline.session_source(),
            session_notes: cfg.pipeline.session_notes.clone(),
            read_poll: Duration::from_millis(cfg.pipeline.read_poll_ms.max(1)),
            eof_backoff: Duration::from_millis(cfg.pipeline.eof_backoff_ms),
            stop_timeout: Duration::from_millis(cfg.termination.stop_timeout_ms),
        }
    }
}

/// Monotonic supervisor counters.
#[derive(Debug, Default)]
pub struct SupervisorCounters {
    runs_started: AtomicU64,
    launch_failures: AtomicU64,
    lines_read: AtomicU64,
    parse_skips: AtomicU64,
    persist_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub runs_started: u64,
    pub launch_failures: u64,
    pub lines_read: u64,
    pub parse_skips: u64,
    pub persist_failures: u64,
    pub processes_reaped: u64,
}

/// How long the read loop keeps draining stdout after the pipeline exited.
/// Helpers that inherited the pipe can hold it open indefinitely.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// State shared between the control surface and the read-loop thread.
struct Shared {
    state: AtomicU8,
    /// Bumped for every launched run; a loop whose generation is stale must
    /// not touch `state` or sweep.
    generation: AtomicU64,
    /// Held across a generation check and the state change or sweep it guards.
    transition: Mutex<()>,
    session: AtomicU64,
    pipeline_pid: AtomicU32,
    stats: SharedStats,
    store: Arc<dyn MetricsStore>,
    reaper: Arc<ResourceReaper>,
    counters: SupervisorCounters,
    options: SupervisorOptions,
}

impl Shared {
    fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::SeqCst);
        debug!("Run state -> {}", state);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Runs `f` under the transition lock if `generation` is still current.
    fn if_current<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_current(generation) {
            Some(f())
        } else {
            None
        }
    }

    fn end_session(&self, session: Option<SessionId>) {
        if let Some(id) = session {
            if let Err(e) = self.store.end_session(id) {
                warn!("Failed to end session {}: {}", id, e);
            }
        }
    }
}

/// Handle to the read-loop thread of the active run.
struct ActiveRun {
    generation: u64,
    child: ChildHandle,
    cancel: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveRun {
    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Read loop of run {} panicked", self.generation);
            }
        }
    }
}

pub struct Supervisor {
    shared: Arc<Shared>,
    control: Mutex<Option<ActiveRun>>,
}

impl Supervisor {
    /// Supervisor with a `/proc` + signal based reaper built from `config.reaper`.
    pub fn new(config: &Config, store: Arc<dyn MetricsStore>) -> Self {
        let reaper = Arc::new(ResourceReaper::new(config.reaper.clone()));
        Self::with_reaper(SupervisorOptions::from(config), store, reaper)
    }

    pub fn with_reaper(
        options: SupervisorOptions,
        store: Arc<dyn MetricsStore>,
        reaper: Arc<ResourceReaper>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(RunState::Idle as u8),
                generation: AtomicU64::new(0),
                transition: Mutex::new(()),
                session: AtomicU64::new(0),
                pipeline_pid: AtomicU32::new(0),
                stats: SharedStats::new(options.cadence),
                store,
                reaper,
                counters: SupervisorCounters::default(),
                options,
            }),
            control: Mutex::new(None),
        }
    }

    fn lock_control(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    /// Copy of the current statistics.
    pub fn stats(&self) -> DetectionStats {
        self.shared.stats.snapshot()
    }

    /// Copy of the time series as index-aligned sequences.
    pub fn time_series(&self) -> TimeSeriesSnapshot {
        self.shared.stats.time_series()
    }

    pub fn counters(&self) -> CountersSnapshot {
        let c = &self.shared.counters;
        CountersSnapshot {
            runs_started: c.runs_started.load(Ordering::Relaxed),
            launch_failures: c.launch_failures.load(Ordering::Relaxed),
            lines_read: c.lines_read.load(Ordering::Relaxed),
            parse_skips: c.parse_skips.load(Ordering::Relaxed),
            persist_failures: c.persist_failures.load(Ordering::Relaxed),
            processes_reaped: self.shared.reaper.reaped_total(),
        }
    }

    /// Session of the active run, if one could be opened.
    pub fn current_session(&self) -> Option<SessionId> {
        match self.shared.session.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Pid of the active pipeline.
    pub fn pipeline_pid(&self) -> Option<u32> {
        match self.shared.pipeline_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn reaper(&self) -> &Arc<ResourceReaper> {
        &self.shared.reaper
    }

    pub fn store(&self) -> &Arc<dyn MetricsStore> {
        &self.shared.store
    }

    /// Launches a run unless one is active.
    ///
    /// Blocks for the defensive sweep and the launch itself, never for the run.
    pub fn start(&self) -> Result<StartStatus, SupervisorError> {
        let mut control = self.lock_control();
        if self.shared.state().is_active() {
            debug!("Start rejected, run already active ({})", self.shared.state());
            return Ok(StartStatus::AlreadyRunning);
        }
        // Previous loop ended on its own; its thread is past teardown
        if let Some(mut previous) = control.take() {
            previous.join();
        }

        let shared = &self.shared;
        shared.set_state(RunState::Starting);

        let report = shared.reaper.sweep();
        if report.processes() > 0 {
            info!("Reaped {} leftover process(es) before start", report.processes());
        }

        shared.stats.reset();

        let opts = &shared.options;
        let session = match shared.store.start_session(&opts.session_source, &opts.session_notes) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to open session, running without one: {}", e);
                None
            }
        };

        let handle = match ProcessHandle::start(&opts.launch, shared.reaper.clone(), opts.policy) {
            Ok(handle) => handle,
            Err(e) => {
                shared.counters.launch_failures.fetch_add(1, Ordering::Relaxed);
                error!("Pipeline launch failed: {}", e);
                shared.end_session(session);
                shared.set_state(RunState::Idle);
                return Err(e.into());
            }
        };

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let pid = handle.pid();
        let child = handle.child();

        shared.session.store(session.unwrap_or(0), Ordering::SeqCst);
        shared.pipeline_pid.store(pid, Ordering::SeqCst);
        shared.set_state(RunState::Running);

        let loop_shared = Arc::clone(shared);
        let loop_cancel = Arc::clone(&cancel);
        let spawned = thread::Builder::new()
            .name(format!("read-loop-{generation}"))
            .spawn(move || {
                run_read_loop(loop_shared, handle, session, loop_cancel, generation, done_tx)
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                // The handle was dropped with the closure, which kills the child
                shared.counters.launch_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to spawn read loop: {}", e);
                shared.end_session(session);
                shared.session.store(0, Ordering::SeqCst);
                shared.pipeline_pid.store(0, Ordering::SeqCst);
                shared.set_state(RunState::Idle);
                return Err(SupervisorError::LaunchFailed {
                    reason: format!("read loop thread: {e}"),
                });
            }
        };

        shared.counters.runs_started.fetch_add(1, Ordering::Relaxed);
        info!("Run {} started (pid {}, session {:?})", generation, pid, session);

        *control = Some(ActiveRun {
            generation,
            child,
            cancel,
            done: done_rx,
            thread: Some(thread),
        });
        Ok(StartStatus::Started)
    }

    /// Stops the active run and waits (bounded) for its teardown.
    ///
    /// A run that is already tearing itself down reports `AlreadyStopped`.
    /// When the read loop misses `stop_timeout`, the pipeline group is killed
    /// from here and the run is only abandoned once the child is reaped.
    pub fn stop(&self) -> StopStatus {
        let mut control = self.lock_control();
        if self.shared.state() != RunState::Running {
            debug!("Stop rejected, state is {}", self.shared.state());
            return StopStatus::AlreadyStopped;
        }
        let Some(mut run) = control.take() else {
            return StopStatus::AlreadyStopped;
        };

        info!("Stopping run {}", run.generation);
        run.cancel.store(true, Ordering::SeqCst);

        let opts = &self.shared.options;
        match run.done.recv_timeout(opts.stop_timeout) {
            Ok(()) => run.join(),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Read loop of run {} did not finish within {:?}, killing pipeline {}",
                    run.generation,
                    opts.stop_timeout,
                    run.child.pid()
                );
                if run.child.kill_group(opts.policy.kill_wait, opts.policy.poll_interval) {
                    self.abandon(run.generation);
                } else {
                    error!(
                        "Pipeline {} survived SIGKILL, run {} stays in teardown",
                        run.child.pid(),
                        run.generation
                    );
                    // The loop still owns the transition to Idle
                    *control = Some(run);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("Read loop of run {} exited without teardown", run.generation);
                run.join();
                if !run.child.kill_group(opts.policy.kill_wait, opts.policy.poll_interval) {
                    error!("Pipeline {} survived SIGKILL", run.child.pid());
                }
                self.abandon(run.generation);
            }
        }
        StopStatus::Stopped
    }

    /// Detaches a run whose loop did not report back and cleans up in its place.
    ///
    /// The caller has confirmed the pipeline is gone.
    fn abandon(&self, generation: u64) {
        let shared = &self.shared;
        let _guard = shared.transition.lock().unwrap_or_else(PoisonError::into_inner);
        // Demote the old loop so it cannot sweep or change state later
        let _ = shared.generation.compare_exchange(
            generation,
            generation + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let session = self.current_session();
        shared.end_session(session);
        shared.session.store(0, Ordering::SeqCst);
        shared.pipeline_pid.store(0, Ordering::SeqCst);
        shared.reaper.sweep();
        shared.set_state(RunState::Idle);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.shared.state() == RunState::Running {
            self.stop();
        }
    }
}

fn run_read_loop(
    shared: Arc<Shared>,
    mut handle: ProcessHandle,
    session: Option<SessionId>,
    cancel: Arc<AtomicBool>,
    generation: u64,
    done: Sender<()>,
) {
    let opts = &shared.options;
    let mut exited_at: Option<Instant> = None;
    let reason = loop {
        if cancel.load(Ordering::SeqCst) {
            break "stop requested";
        }
        if !shared.is_current(generation) {
            break "superseded";
        }

        match handle.read_line(opts.read_poll) {
            Ok(ReadOutcome::Line(line)) => {
                shared.counters.lines_read.fetch_add(1, Ordering::Relaxed);
                let effect = shared.stats.apply_line(&line);
                if effect.skipped > 0 {
                    shared
                        .counters
                        .parse_skips
                        .fetch_add(effect.skipped as u64, Ordering::Relaxed);
                }
                for request in effect.persist {
                    let Some(id) = session else { continue };
                    if let Err(e) = shared.store.save_metrics(id, request) {
                        shared.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                        warn!("Failed to save metrics for session {}: {}", id, e);
                    }
                }
            }
            Ok(ReadOutcome::WouldBlock) => {
                // Keep reading until stdout closes; the reader may lag the exit
                if !handle.is_alive() {
                    let since = *exited_at.get_or_insert_with(Instant::now);
                    if since.elapsed() >= EXIT_DRAIN_GRACE {
                        break "pipeline exited, stdout held open";
                    }
                }
            }
            Ok(ReadOutcome::Eof) => {
                if !handle.is_alive() {
                    break "pipeline exited";
                }
                thread::sleep(opts.eof_backoff);
            }
            Err(e) => {
                warn!("Reading pipeline output failed: {}", e);
                break "read failure";
            }
        }
    };

    info!("Read loop of run {} ending: {}", generation, reason);
    teardown(&shared, &mut handle, session, generation);
    let _ = done.send(());
}

fn teardown(shared: &Shared, handle: &mut ProcessHandle, session: Option<SessionId>, generation: u64) {
    shared.if_current(generation, || shared.set_state(RunState::Stopping));

    shared.end_session(session);

    // Only this run's process group; the sweep below is gated
    let outcome = handle.stop_process();

    let finished = shared.if_current(generation, || {
        let report = shared.reaper.sweep();
        shared.session.store(0, Ordering::SeqCst);
        shared.pipeline_pid.store(0, Ordering::SeqCst);
        shared.set_state(RunState::Idle);
        report
    });

    match finished {
        Some(report) => info!(
            "Pipeline {} stopped ({:?}, exited: {}, swept {} process(es))",
            handle.pid(),
            outcome.escalated_to,
            outcome.exited,
            report.processes()
        ),
        None => debug!(
            "Run {} was superseded, skipped sweep and state change",
            generation
        ),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ReaperConfig;
    use crate::process::{ProcessInfo, Signaler, StaticLister};
    use crate::stats::RiskLevel;
    use crate::store::MemoryStore;
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    const STUBBORN: &str = "sh -c 'trap \"\" INT TERM; while true; do sleep 0.05; done'";

    /// Records signals instead of sending them; nothing is ever alive afterwards.
    #[derive(Default)]
    struct RecordingSignaler {
        sent: Mutex<Vec<(u32, Signal)>>,
    }

    impl RecordingSignaler {
        fn sent(&self) -> Vec<(u32, Signal)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Signaler for RecordingSignaler {
        fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno> {
            self.sent.lock().unwrap().push((pid, signal));
            Ok(())
        }

        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    /// Pid of a leftover pipeline that only exists in the fake process table.
    const LEFTOVER_PID: u32 = 4_000_000;

    fn options(command: &str) -> SupervisorOptions {
        SupervisorOptions {
            launch: LaunchSpec {
                command: command.into(),
                ..Default::default()
            },
            policy: TerminationPolicy {
                interrupt_wait: Duration::from_millis(300),
                terminate_wait: Duration::from_millis(200),
                kill_wait: Duration::from_millis(500),
                poll_interval: Duration::from_millis(10),
            },
            cadence: StatsCadence::default(),
            session_source: "test".into(),
            session_notes: "unit".into(),
            read_poll: Duration::from_millis(20),
            eof_backoff: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(5),
        }
    }

    fn supervisor(command: &str) -> (Supervisor, Arc<MemoryStore>) {
        supervisor_with(options(command))
    }

    fn supervisor_with(options: SupervisorOptions) -> (Supervisor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let reaper = Arc::new(ResourceReaper::new(ReaperConfig::disabled()));
        (Supervisor::with_reaper(options, store.clone(), reaper), store)
    }

    /// Supervisor whose reaper sees one leftover `detection.py` and records signals.
    fn recorded_supervisor(options: SupervisorOptions) -> (Supervisor, Arc<RecordingSignaler>) {
        let config = ReaperConfig {
            process_names: Vec::new(),
            command_substrings: vec!["detection.py".into()],
            grace_ms: 0,
            purge_ipc: false,
            reap_on_startup: false,
        };
        let lister = StaticLister::new(vec![ProcessInfo {
            pid: LEFTOVER_PID,
            name: "python3".into(),
            cmdline: "python3 detection.py -i /dev/video0".into(),
        }]);
        let signaler = Arc::new(RecordingSignaler::default());
        let reaper = Arc::new(ResourceReaper::with_backends(
            config,
            Arc::new(lister),
            signaler.clone(),
        ));
        let store = Arc::new(MemoryStore::default());
        (Supervisor::with_reaper(options, store, reaper), signaler)
    }

    /// Options whose stop deadline is shorter than the escalation.
    fn impatient_options(command: &str) -> SupervisorOptions {
        let mut opts = options(command);
        opts.policy = TerminationPolicy {
            interrupt_wait: Duration::from_millis(2000),
            terminate_wait: Duration::from_millis(1000),
            kill_wait: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        };
        opts.stop_timeout = Duration::from_millis(1000);
        opts
    }

    fn process_exists(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_stop_when_idle() {
        let (sup, signals) = recorded_supervisor(options("sleep 30"));
        assert_eq!(sup.stop(), StopStatus::AlreadyStopped);
        assert_eq!(sup.state(), RunState::Idle);
        assert!(sup.store().sessions(10).is_empty());

        assert!(signals.sent().is_empty());
        assert_eq!(sup.reaper().reaped_total(), 0);
    }

    #[test]
    fn test_second_start_reports_already_running() {
        let (sup, store) = supervisor("sleep 30");
        assert_eq!(sup.start().unwrap(), StartStatus::Started);
        assert_eq!(sup.start().unwrap(), StartStatus::AlreadyRunning);
        assert_eq!(sup.counters().runs_started, 1);
        assert_eq!(store.sessions(10).len(), 1);

        assert_eq!(sup.stop(), StopStatus::Stopped);
        assert_eq!(sup.state(), RunState::Idle);
        assert_eq!(sup.stop(), StopStatus::AlreadyStopped);
    }

    #[test]
    fn test_run_ends_when_pipeline_exits() {
        let (sup, store) = supervisor(
            "printf 'Frame count: 20\\nUnique bees: 10\\nUnique varroa: 2\\n'",
        );
        sup.start().unwrap();
        assert!(wait_for(|| sup.state() == RunState::Idle));

        let stats = sup.stats();
        assert_eq!(stats.total_frames, 20);
        assert_eq!(stats.unique_bees, 10);
        assert_eq!(stats.unique_varroa, 2);
        assert_eq!(stats.infestation_ratio, 0.2);
        assert_eq!(stats.infestation_risk_level, RiskLevel::Critical);
        assert_eq!(sup.counters().lines_read, 3);

        // Sampled on the frame line, before the unique counts arrived
        let series = sup.time_series();
        assert_eq!(series.len(), 1);
        assert_eq!(series.bee_counts, vec![0]);
        assert_eq!(series.varroa_counts, vec![0]);
        assert_eq!(series.infestation_ratio, vec![0.0]);

        let sessions = store.sessions(1);
        assert!(sessions[0].end_time.is_some());
        assert_eq!(sup.current_session(), None);
    }

    #[test]
    fn test_restart_resets_stats() {
        let dir = tempfile::tempdir().unwrap();
        let feed = dir.path().join("feed.txt");
        std::fs::write(&feed, "Unique bees: 7\n").unwrap();

        let (sup, _store) = supervisor(&format!("cat {}", feed.display()));
        sup.start().unwrap();
        assert!(wait_for(|| sup.state() == RunState::Idle));
        assert_eq!(sup.stats().unique_bees, 7);

        std::fs::write(&feed, "Frame count: 3\n").unwrap();
        sup.start().unwrap();
        assert!(wait_for(|| sup.state() == RunState::Idle));

        let stats = sup.stats();
        assert_eq!(stats.total_frames, 3);
        assert_eq!(stats.unique_bees, 0);
        assert_eq!(sup.counters().runs_started, 2);
    }

    #[test]
    fn test_launch_failure_returns_to_idle() {
        let (sup, store) = supervisor("   ");
        let err = sup.start().unwrap_err();
        assert!(matches!(err, SupervisorError::LaunchFailed { .. }));
        assert_eq!(sup.state(), RunState::Idle);
        assert_eq!(sup.counters().launch_failures, 1);
        assert!(store.sessions(1)[0].end_time.is_some());
    }

    #[test]
    fn test_persists_every_hundred_frames() {
        let (sup, store) = supervisor(
            "sh -c 'echo \"Unique bees: 50\"; i=1; while [ $i -le 250 ]; do echo \"Frame count: $i\"; i=$((i+1)); done'",
        );
        sup.start().unwrap();
        assert!(wait_for(|| sup.state() == RunState::Idle));

        let metrics = store.latest_metrics(10, None);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].frame_count, 200);
        assert_eq!(metrics[1].frame_count, 100);
        assert_eq!(sup.time_series().len(), 25);
    }

    #[test]
    fn test_stop_escalates_on_stubborn_pipeline() {
        let (sup, _store) = supervisor(STUBBORN);
        sup.start().unwrap();
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        assert_eq!(sup.stop(), StopStatus::Stopped);
        assert_eq!(sup.state(), RunState::Idle);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(sup.pipeline_pid(), None);
    }

    #[test]
    fn test_stop_timeout_kills_pipeline_before_idle() {
        let (sup, _store) = supervisor_with(impatient_options(STUBBORN));
        sup.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        let old_pid = sup.pipeline_pid().unwrap();

        let started = Instant::now();
        assert_eq!(sup.stop(), StopStatus::Stopped);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(sup.state(), RunState::Idle);
        assert!(!process_exists(old_pid));

        assert_eq!(sup.start().unwrap(), StartStatus::Started);
        let new_pid = sup.pipeline_pid().unwrap();
        assert_ne!(new_pid, old_pid);
        assert!(process_exists(new_pid));
        assert!(!process_exists(old_pid));

        assert_eq!(sup.stop(), StopStatus::Stopped);
        assert!(!process_exists(new_pid));
    }

    #[test]
    fn test_abandoned_loop_does_not_sweep() {
        let (sup, signals) = recorded_supervisor(impatient_options(STUBBORN));
        sup.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        // Sweep before launch
        assert_eq!(signals.sent(), vec![(LEFTOVER_PID, Signal::SIGINT)]);

        assert_eq!(sup.stop(), StopStatus::Stopped);
        assert_eq!(sup.state(), RunState::Idle);
        // Plus the sweep of the abandon path
        assert_eq!(signals.sent().len(), 2);

        // The old loop wakes up once its child is reaped and must leave both alone
        thread::sleep(Duration::from_millis(600));
        assert_eq!(signals.sent().len(), 2);
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[test]
    fn test_output_after_leader_exit_is_still_read() {
        let (sup, _store) =
            supervisor("sh -c '(sleep 0.3; echo \"Unique bees: 9\") & exit 0'");
        sup.start().unwrap();
        assert!(wait_for(|| sup.state() == RunState::Idle));

        assert_eq!(sup.stats().unique_bees, 9);
        assert_eq!(sup.counters().lines_read, 1);
    }
}

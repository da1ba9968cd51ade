//! Escalating shutdown of a single child process.
//!
//! Stages run Running -> InterruptSent -> TerminateSent -> KillSent -> Exited.
//! Each signal stage waits up to its own deadline for the process to exit
//! before escalating, so the whole sequence is bounded by the sum of the
//! deadlines in [`TerminationPolicy`].

use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::TerminationConfig;

/// What the escalation needs from a process.
pub trait ProcessControl {
    fn pid(&self) -> u32;

    /// Delivers `signal`. `Err(Errno::ESRCH)` means the process is already gone.
    fn signal(&mut self, signal: Signal) -> Result<(), Errno>;

    /// Non-blocking exit check; also reaps the child when it has exited.
    fn has_exited(&mut self) -> bool;
}

/// Stage of the escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TerminationStage {
    Running,
    InterruptSent,
    TerminateSent,
    KillSent,
    Exited,
}

/// Deadlines for each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub interrupt_wait: Duration,
    pub terminate_wait: Duration,
    pub kill_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self::from(&TerminationConfig::default())
    }
}

impl From<&TerminationConfig> for TerminationPolicy {
    fn from(cfg: &TerminationConfig) -> Self {
        Self {
            interrupt_wait: Duration::from_millis(cfg.interrupt_wait_ms),
            terminate_wait: Duration::from_millis(cfg.terminate_wait_ms),
            kill_wait: Duration::from_millis(cfg.kill_wait_ms),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
        }
    }
}

impl TerminationPolicy {
    /// Upper bound on the time [`terminate`] can take.
    pub fn total_budget(&self) -> Duration {
        self.interrupt_wait + self.terminate_wait + self.kill_wait
    }
}

/// Result of one escalation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationOutcome {
    /// Last signal stage reached before the process was seen gone
    /// (`Running` when it had already exited).
    pub escalated_to: TerminationStage,
    /// Whether the process was confirmed gone at the end.
    pub exited: bool,
    pub elapsed: Duration,
}

/// Runs the escalation against `process`.
///
/// Calling this on a process that already exited sends nothing. Signal
/// failures other than ESRCH are logged and the escalation continues.
pub fn terminate<P: ProcessControl + ?Sized>(
    process: &mut P,
    policy: &TerminationPolicy,
) -> TerminationOutcome {
    let started = Instant::now();
    let pid = process.pid();

    if process.has_exited() {
        debug!("Process {} already exited, nothing to terminate", pid);
        return TerminationOutcome {
            escalated_to: TerminationStage::Running,
            exited: true,
            elapsed: started.elapsed(),
        };
    }

    let steps = [
        (Signal::SIGINT, TerminationStage::InterruptSent, policy.interrupt_wait),
        (Signal::SIGTERM, TerminationStage::TerminateSent, policy.terminate_wait),
        (Signal::SIGKILL, TerminationStage::KillSent, policy.kill_wait),
    ];

    let mut stage = TerminationStage::Running;
    for (signal, next, wait) in steps {
        if stage != TerminationStage::Running {
            info!("Process {} still alive after {:?}, sending {:?}", pid, stage, signal);
        }
        match process.signal(signal) {
            Ok(()) => debug!("Sent {:?} to {}", signal, pid),
            Err(Errno::ESRCH) => {
                return TerminationOutcome {
                    escalated_to: stage,
                    exited: true,
                    elapsed: started.elapsed(),
                };
            }
            Err(e) => warn!("Failed to send {:?} to {}: {}", signal, pid, e),
        }
        stage = next;

        if wait_for_exit(process, wait, policy.poll_interval) {
            return TerminationOutcome {
                escalated_to: stage,
                exited: true,
                elapsed: started.elapsed(),
            };
        }
    }

    warn!("Process {} survived SIGKILL for {:?}", pid, policy.kill_wait);
    TerminationOutcome {
        escalated_to: stage,
        exited: false,
        elapsed: started.elapsed(),
    }
}

fn wait_for_exit<P: ProcessControl + ?Sized>(
    process: &mut P,
    deadline: Duration,
    poll: Duration,
) -> bool {
    let start = Instant::now();
    loop {
        if process.has_exited() {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return false;
        }
        thread::sleep(poll.min(deadline - elapsed));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Exits a fixed delay after receiving one of the signals in `exits_on`.
    pub(crate) struct FakeProcess {
        pub sent: Vec<Signal>,
        exits_on: Vec<Signal>,
        exit_delay: Duration,
        exit_at: Option<Instant>,
        exited: bool,
    }

    impl FakeProcess {
        pub(crate) fn new(exits_on: &[Signal], exit_delay: Duration) -> Self {
            Self {
                sent: Vec::new(),
                exits_on: exits_on.to_vec(),
                exit_delay,
                exit_at: None,
                exited: false,
            }
        }

        pub(crate) fn already_exited() -> Self {
            let mut p = Self::new(&[], Duration::ZERO);
            p.exited = true;
            p
        }
    }

    impl ProcessControl for FakeProcess {
        fn pid(&self) -> u32 {
            4242
        }

        fn signal(&mut self, signal: Signal) -> Result<(), Errno> {
            if self.exited {
                return Err(Errno::ESRCH);
            }
            self.sent.push(signal);
            if self.exits_on.contains(&signal) && self.exit_at.is_none() {
                self.exit_at = Some(Instant::now() + self.exit_delay);
            }
            Ok(())
        }

        fn has_exited(&mut self) -> bool {
            if let Some(at) = self.exit_at {
                if Instant::now() >= at {
                    self.exited = true;
                }
            }
            self.exited
        }
    }

    fn fast_policy() -> TerminationPolicy {
        TerminationPolicy {
            interrupt_wait: Duration::from_millis(200),
            terminate_wait: Duration::from_millis(100),
            kill_wait: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_graceful_exit_on_interrupt() {
        let mut p = FakeProcess::new(&[Signal::SIGINT], Duration::from_millis(20));
        let outcome = terminate(&mut p, &fast_policy());

        assert!(outcome.exited);
        assert_eq!(outcome.escalated_to, TerminationStage::InterruptSent);
        assert_eq!(p.sent, vec![Signal::SIGINT]);
    }

    #[test]
    fn test_escalates_to_terminate() {
        let mut p = FakeProcess::new(&[Signal::SIGTERM], Duration::ZERO);
        let outcome = terminate(&mut p, &fast_policy());

        assert!(outcome.exited);
        assert_eq!(outcome.escalated_to, TerminationStage::TerminateSent);
        assert_eq!(p.sent, vec![Signal::SIGINT, Signal::SIGTERM]);
        assert!(outcome.elapsed >= Duration::from_millis(200));
    }

    #[test]
    fn test_interrupt_ignoring_process_is_killed_within_budget() {
        let mut p = FakeProcess::new(&[Signal::SIGKILL], Duration::ZERO);
        let policy = fast_policy();
        let outcome = terminate(&mut p, &policy);

        assert!(outcome.exited);
        assert_eq!(outcome.escalated_to, TerminationStage::KillSent);
        assert_eq!(p.sent, vec![Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL]);
        assert!(outcome.elapsed < policy.total_budget() + Duration::from_millis(100));
    }

    #[test]
    fn test_already_exited_sends_nothing() {
        let mut p = FakeProcess::already_exited();
        let outcome = terminate(&mut p, &fast_policy());

        assert!(outcome.exited);
        assert_eq!(outcome.escalated_to, TerminationStage::Running);
        assert!(p.sent.is_empty());
    }

    #[test]
    fn test_unkillable_reports_not_exited() {
        let mut p = FakeProcess::new(&[], Duration::ZERO);
        let outcome = terminate(&mut p, &fast_policy());

        assert!(!outcome.exited);
        assert_eq!(outcome.escalated_to, TerminationStage::KillSent);
    }

    #[test]
    fn test_default_policy_budget() {
        let policy = TerminationPolicy::default();
        assert_eq!(policy.interrupt_wait, Duration::from_secs(2));
        assert_eq!(policy.terminate_wait, Duration::from_secs(1));
        assert_eq!(policy.total_budget(), Duration::from_millis(3500));
    }
}

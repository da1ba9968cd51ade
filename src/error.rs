//! Error types for the supervision core.
//!
//! Only launch failures and store failures ever reach a caller. Cleanup
//! failures (signal delivery, IPC removal) are logged where they happen and
//! never surface as errors, and read failures end the read loop the same way
//! a normal pipeline exit does.

use std::io;

/// Errors reported by the [`Supervisor`](crate::supervisor::Supervisor) control surface.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Pipeline failed to launch: {reason}")]
    LaunchFailed { reason: String },
}

/// Errors raised when a [`ProcessHandle`](crate::process::ProcessHandle) cannot be created.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Pipeline command is empty")]
    EmptyCommand,

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Spawned pipeline has no {stream} pipe")]
    MissingPipe { stream: &'static str },
}

impl From<LaunchError> for SupervisorError {
    fn from(err: LaunchError) -> Self {
        SupervisorError::LaunchFailed {
            reason: err.to_string(),
        }
    }
}

/// Errors raised by the persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Store journal entry is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown session id {0}")]
    UnknownSession(u64),
}

/// A marker was found on a line but the value after it is not a count.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unparseable value after '{marker}': {text:?}")]
pub struct ParseSkip {
    pub marker: &'static str,
    pub text: String,
}

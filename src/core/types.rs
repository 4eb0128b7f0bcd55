//! Engine-level state and result types.

use std::fmt;
use std::time::Duration;

/// Current state of a sandbox run. Monotonic except for Error, which may be
/// entered from any state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Initializing,
    Preparing,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Created => "created",
            SandboxState::Initializing => "initializing",
            SandboxState::Preparing => "preparing",
            SandboxState::Running => "running",
            SandboxState::Stopping => "stopping",
            SandboxState::Stopped => "stopped",
            SandboxState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Outcome of one sandbox run. Produced exactly once per `run`.
#[derive(Clone, Debug)]
pub struct SandboxResult {
    /// Child exit code, or the negated signal number on signal death.
    pub exit_code: i32,
    pub success: bool,
    pub error_message: Option<String>,
    /// Wall-clock duration of the whole run including setup and cleanup.
    pub duration: Duration,
    /// Captured stdout and stderr of the child (single shared pipe).
    pub stdout: String,
    /// Child pid, or -1 if the child was never forked.
    pub child_pid: i32,
}

impl SandboxResult {
    pub(crate) fn failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            success: false,
            error_message: Some(message.into()),
            duration: Duration::ZERO,
            stdout: String::new(),
            child_pid: -1,
        }
    }
}

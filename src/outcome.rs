/// The single structured result of a supervised run.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which of the child's output streams an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Failures that end a run without a normal or timed-out result.
#[derive(Debug)]
pub enum RunError {
    /// The script could not be started at all.
    Launch {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The deadline fired but the process group could not be signalled.
    TimeoutKill {
        pgid: i32,
        source: nix::errno::Errno,
    },
    /// The script started but its exit could not be observed.
    Wait { source: std::io::Error },
    /// Draining or forwarding one of the output streams failed.
    Capture {
        stream: Stream,
        source: std::io::Error,
    },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Launch { path, source } => {
                write!(f, "failed to launch {}: {}", path.display(), source)
            }
            RunError::TimeoutKill { pgid, source } => {
                write!(
                    f,
                    "deadline reached but process group {} could not be killed: {}",
                    pgid, source
                )
            }
            RunError::Wait { source } => {
                write!(f, "failed to wait for script exit: {}", source)
            }
            RunError::Capture { stream, source } => {
                write!(f, "failed to capture {}: {}", stream, source)
            }
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Launch { source, .. } => Some(source),
            RunError::TimeoutKill { source, .. } => Some(source),
            RunError::Wait { source } => Some(source),
            RunError::Capture { source, .. } => Some(source),
        }
    }
}

/// Disjoint result tag of a run.
#[derive(Debug)]
pub enum RunStatus {
    /// Exited with status 0 before the deadline.
    Success,
    /// Exited before the deadline with a non-zero code or by a signal.
    ExecutionError {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Overran the deadline and its process group was signalled.
    TimedOut { timeout: Duration },
    Failed(RunError),
}

/// Captured output plus the resolved status of one supervised script run.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: RunStatus,
    /// Child PID, `None` when the launch failed.
    pub pid: Option<u32>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

/// Process exit codes used by the CLI for each outcome.
pub const EXIT_WAIT_FAILED: i32 = 1;
pub const EXIT_TIMED_OUT: i32 = 124;
pub const EXIT_KILL_FAILED: i32 = 125;
pub const EXIT_CAPTURE_FAILED: i32 = 126;
pub const EXIT_LAUNCH_FAILED: i32 = 127;

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Success)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self.status, RunStatus::TimedOut { .. })
    }

    /// The underlying error, if the run failed.
    pub fn error(&self) -> Option<&RunError> {
        match &self.status {
            RunStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Exit code a wrapper process should report for this outcome.
    pub fn exit_code(&self) -> i32 {
        match &self.status {
            RunStatus::Success => 0,
            RunStatus::ExecutionError { code, signal } => match (code, signal) {
                (Some(c), _) => *c,
                (None, Some(s)) => 128 + s,
                (None, None) => 1,
            },
            RunStatus::TimedOut { .. } => EXIT_TIMED_OUT,
            RunStatus::Failed(RunError::TimeoutKill { .. }) => EXIT_KILL_FAILED,
            RunStatus::Failed(RunError::Wait { .. }) => EXIT_WAIT_FAILED,
            RunStatus::Failed(RunError::Capture { .. }) => EXIT_CAPTURE_FAILED,
            RunStatus::Failed(RunError::Launch { .. }) => EXIT_LAUNCH_FAILED,
        }
    }

    /// Serializable view of the outcome, used for `--json`.
    pub fn summary(&self) -> OutcomeSummary {
        let (status, exit_code, signal) = match &self.status {
            RunStatus::Success => ("success", Some(0), None),
            RunStatus::ExecutionError { code, signal } => ("execution_error", *code, *signal),
            RunStatus::TimedOut { .. } => ("timed_out", None, None),
            RunStatus::Failed(RunError::Launch { .. }) => ("launch_error", None, None),
            RunStatus::Failed(RunError::TimeoutKill { .. }) => ("timeout_kill_error", None, None),
            RunStatus::Failed(RunError::Wait { .. }) => ("wait_error", None, None),
            RunStatus::Failed(RunError::Capture { .. }) => ("capture_error", None, None),
        };
        OutcomeSummary {
            status,
            exit_code,
            signal,
            error: self.error().map(|e| e.to_string()),
            pid: self.pid,
            started_at: self.started_at,
            duration_ms: self.duration.as_millis() as u64,
            stdout_bytes: self.stdout.len(),
            stderr_bytes: self.stderr.len(),
        }
    }
}

/// JSON payload describing an outcome without the captured bytes.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeSummary {
    pub status: &'static str,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub error: Option<String>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
}

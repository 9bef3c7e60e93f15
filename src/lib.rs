//! Run an external script under a wall-clock deadline.
//!
//! The script's stdout and stderr are mirrored live and captured in memory;
//! if it overruns its budget, its whole process group is terminated.

#[cfg(not(unix))]
compile_error!("cmd-runner relies on Unix process groups");

pub mod capture;
pub mod config;
pub mod outcome;
pub mod supervisor;

pub use capture::CaptureSink;
pub use config::{RunnerConfig, SupervisorConfig};
pub use outcome::{ExecutionOutcome, OutcomeSummary, RunError, RunStatus, Stream};
pub use supervisor::{effective_timeout, normalize_script_path, Supervisor, DEFAULT_TIMEOUT};

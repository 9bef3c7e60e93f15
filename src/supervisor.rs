/// Deadline-bound script supervisor.
///
/// Launches a script as the leader of a fresh process group, tees its stdout
/// and stderr through two `CaptureSink`s on dedicated drain tasks, and races
/// process exit against a wall-clock deadline. On expiry the whole group is
/// signalled so grandchildren are not left behind.
use crate::capture::CaptureSink;
use crate::config::SupervisorConfig;
use crate::outcome::{ExecutionOutcome, RunError, RunStatus, Stream};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, getpgrp, Pid};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// Budget applied when the caller passes a non-positive timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const READ_CHUNK: usize = 8 * 1024;
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Resolve a caller-supplied timeout in seconds, applying the default for `<= 0`.
pub fn effective_timeout(secs: i64) -> Duration {
    if secs <= 0 {
        DEFAULT_TIMEOUT
    } else {
        Duration::from_secs(secs as u64)
    }
}

/// Strip surrounding whitespace (including a trailing newline) from a script path.
///
/// Returns `None` if nothing is left.
pub fn normalize_script_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

/// Runs one script at a time under a wall-clock deadline.
#[derive(Debug, Clone)]
pub struct Supervisor {
    timeout: Duration,
    kill_grace: Duration,
    escalate: bool,
}

impl Supervisor {
    /// Supervisor with the given timeout in seconds and default kill settings.
    pub fn new(timeout_secs: i64) -> Self {
        Self::from_config(&SupervisorConfig {
            timeout_secs,
            ..SupervisorConfig::default()
        })
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            timeout: effective_timeout(config.timeout_secs),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            escalate: config.escalate,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `script`, mirroring its output to this process's stdout and stderr.
    pub async fn run(&self, script: &str) -> ExecutionOutcome {
        self.run_with(script, tokio::io::stdout(), tokio::io::stderr())
            .await
    }

    /// Run `script`, mirroring its output to `out` and `err`.
    pub async fn run_with<O, E>(&self, script: &str, out: O, err: E) -> ExecutionOutcome
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let started_at = Utc::now();
        let start = Instant::now();

        let failed = |path: PathBuf, source: std::io::Error| ExecutionOutcome {
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: RunStatus::Failed(RunError::Launch { path, source }),
            pid: None,
            duration: start.elapsed(),
            started_at,
        };

        let Some(path) = normalize_script_path(script) else {
            tracing::warn!(script, "empty script path");
            return failed(
                PathBuf::from(script),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty script path"),
            );
        };

        let mut child = match Command::new(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // Child leads its own group so the kill reaches descendants
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to launch script");
                return failed(path, e);
            }
        };

        let pid = child.id();
        tracing::info!(
            pid = ?pid,
            path = %path.display(),
            timeout_secs = self.timeout.as_secs(),
            "script started"
        );

        let mut drains = Drains::spawn(&mut child, out, err);

        let deadline = start + self.timeout;
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep_until(deadline) => None,
        };

        let status = match waited {
            Some(waited) => {
                let status = completion_status(waited);
                // Exit status is known; a descendant still holding a pipe open
                // past the deadline is cut off rather than waited on forever.
                if !drains.join_until(deadline).await {
                    tracing::warn!(pid = ?pid, "output still open after exit, killing leftover group");
                    if let Some(pid) = pid {
                        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                            tracing::debug!(pgid = pid, error = %e, "SIGKILL not delivered");
                        }
                    }
                    drains.stop().await;
                }
                status
            }
            None => self.expire(&mut child, pid, &mut drains).await,
        };

        let ((stdout, stdout_err), (stderr, stderr_err)) = drains.collect().await;
        let status = resolve(status, stdout_err, stderr_err);

        let duration = start.elapsed();
        tracing::info!(
            pid = ?pid,
            status = ?status,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            duration_ms = duration.as_millis() as u64,
            "script finished"
        );

        ExecutionOutcome {
            stdout,
            stderr,
            status,
            pid,
            duration,
            started_at,
        }
    }

    /// Deadline fired first: signal the group, reap the child, collect what the drains have.
    async fn expire<O, E>(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        drains: &mut Drains<O, E>,
    ) -> RunStatus
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(pid) = pid else {
            // tokio only clears the pid once the child has been reaped
            return RunStatus::Failed(RunError::TimeoutKill {
                pgid: 0,
                source: Errno::ESRCH,
            });
        };

        let pgid = match kill_process_group(pid) {
            Ok(pgid) => pgid,
            Err(e) => {
                tracing::error!(pid, error = %e, "failed to kill process group on timeout");
                let _ = child.start_kill();
                drains.stop().await;
                return RunStatus::Failed(e);
            }
        };
        tracing::warn!(
            pid,
            pgid = pgid.as_raw(),
            timeout_secs = self.timeout.as_secs(),
            "timeout reached, sent SIGTERM to process group"
        );

        let grace_end = Instant::now() + self.kill_grace;
        let _ = tokio::time::timeout_at(grace_end, child.wait()).await;

        // Escalate on the group, not the direct child: a descendant may ignore
        // SIGTERM after the script itself has died.
        if self.escalate && group_outlives(pgid, grace_end).await {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) => tracing::warn!(pgid = pgid.as_raw(), "escalated to SIGKILL"),
                Err(e) => tracing::debug!(pgid = pgid.as_raw(), error = %e, "SIGKILL not delivered"),
            }
            let _ = tokio::time::timeout(self.kill_grace, child.wait()).await;
        }

        if !drains.join_until(Instant::now() + self.kill_grace).await {
            drains.stop().await;
        }

        RunStatus::TimedOut {
            timeout: self.timeout,
        }
    }
}

/// Resolve the child's process group and send it SIGTERM.
fn kill_process_group(pid: u32) -> Result<Pid, RunError> {
    let child = Pid::from_raw(pid as i32);
    let pgid = getpgid(Some(child)).map_err(|e| RunError::TimeoutKill {
        pgid: child.as_raw(),
        source: e,
    })?;
    if pgid == getpgrp() {
        // Never signal our own group
        return Err(RunError::TimeoutKill {
            pgid: pgid.as_raw(),
            source: Errno::EPERM,
        });
    }
    killpg(pgid, Signal::SIGTERM).map_err(|e| RunError::TimeoutKill {
        pgid: pgid.as_raw(),
        source: e,
    })?;
    Ok(pgid)
}

/// Poll the group until `until`; `true` if any member is still signalable then.
async fn group_outlives(pgid: Pid, until: Instant) -> bool {
    loop {
        if killpg(pgid, None::<Signal>).is_err() {
            return false;
        }
        if Instant::now() >= until {
            return true;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL.min(until.saturating_duration_since(Instant::now())))
            .await;
    }
}

fn completion_status(waited: std::io::Result<ExitStatus>) -> RunStatus {
    match waited {
        Ok(status) if status.success() => RunStatus::Success,
        Ok(status) => RunStatus::ExecutionError {
            code: status.code(),
            signal: status.signal(),
        },
        Err(e) => {
            tracing::warn!(error = %e, "failed to wait for script exit");
            RunStatus::Failed(RunError::Wait { source: e })
        }
    }
}

/// Pick the single status to report once the drains are in.
///
/// Kill and wait failures and execution errors win over capture errors; a
/// capture error wins over success or timeout.
fn resolve(
    status: RunStatus,
    stdout_err: Option<std::io::Error>,
    stderr_err: Option<std::io::Error>,
) -> RunStatus {
    if matches!(
        status,
        RunStatus::Failed(_) | RunStatus::ExecutionError { .. }
    ) {
        return status;
    }
    if let Some(source) = stdout_err {
        return RunStatus::Failed(RunError::Capture {
            stream: Stream::Stdout,
            source,
        });
    }
    if let Some(source) = stderr_err {
        return RunStatus::Failed(RunError::Capture {
            stream: Stream::Stderr,
            source,
        });
    }
    status
}

/// What a drain task hands back once its pipe closes or it is told to stop.
struct Drained<W> {
    sink: CaptureSink<W>,
    error: Option<std::io::Error>,
}

fn spawn_drain<R, W>(
    pipe: Option<R>,
    dest: W,
    stop: watch::Receiver<bool>,
) -> JoinHandle<Drained<W>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let sink = CaptureSink::new(dest);
        match pipe {
            Some(pipe) => drain(pipe, sink, stop).await,
            None => Drained {
                sink,
                error: Some(std::io::Error::other("child pipe was not captured")),
            },
        }
    })
}

/// Copy `pipe` into `sink` until EOF or until told to stop.
///
/// A forwarding failure is remembered but reading continues, so the child
/// never blocks on a full pipe.
async fn drain<R, W>(
    mut pipe: R,
    mut sink: CaptureSink<W>,
    mut stop: watch::Receiver<bool>,
) -> Drained<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut error: Option<std::io::Error> = None;
    let mut stopped = false;

    loop {
        let n = tokio::select! {
            read = pipe.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read child output");
                    if error.is_none() {
                        error = Some(e);
                    }
                    break;
                }
            },
            _ = stop.changed() => {
                stopped = true;
                break;
            }
        };

        // The bytes are captured before forwarding starts, so a stalled
        // destination can be abandoned without losing them.
        let forwarded = tokio::select! {
            forwarded = sink.write(&chunk[..n]) => forwarded,
            _ = stop.changed() => {
                stopped = true;
                break;
            }
        };
        if let Err(e) = forwarded {
            if error.is_none() {
                tracing::warn!(error = %e, "failed to forward child output, still capturing");
                error = Some(e);
            }
        }
    }

    if !stopped {
        tokio::select! {
            flushed = sink.flush() => {
                if let Err(e) = flushed {
                    if error.is_none() {
                        error = Some(e);
                    }
                }
            }
            _ = stop.changed() => {}
        }
    }
    tracing::debug!(bytes = sink.len(), "drain finished");
    Drained { sink, error }
}

/// A drain task, or its result once it has been joined.
enum DrainSlot<W> {
    Running(JoinHandle<Drained<W>>),
    Done(Result<Drained<W>, JoinError>),
}

impl<W> DrainSlot<W> {
    /// Wait for the task. Safe to cancel: a finished result is stored before returning.
    async fn finish(&mut self) {
        if let DrainSlot::Running(handle) = self {
            let joined = handle.await;
            *self = DrainSlot::Done(joined);
        }
    }

    async fn collect(self) -> (Vec<u8>, Option<std::io::Error>) {
        let joined = match self {
            DrainSlot::Running(handle) => handle.await,
            DrainSlot::Done(joined) => joined,
        };
        match joined {
            Ok(drained) => (drained.sink.into_parts().0, drained.error),
            Err(e) => (Vec::new(), Some(std::io::Error::other(e))),
        }
    }
}

/// The stdout and stderr drains of one run.
struct Drains<O, E> {
    stdout: DrainSlot<O>,
    stderr: DrainSlot<E>,
    stop: watch::Sender<bool>,
}

impl<O, E> Drains<O, E>
where
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    fn spawn(child: &mut Child, out: O, err: E) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        Self {
            stdout: DrainSlot::Running(spawn_drain(child.stdout.take(), out, stop_rx.clone())),
            stderr: DrainSlot::Running(spawn_drain(child.stderr.take(), err, stop_rx)),
            stop,
        }
    }

    async fn join(&mut self) {
        self.stdout.finish().await;
        self.stderr.finish().await;
    }

    /// Wait for both pipes to close. Returns `false` if `deadline` passed first.
    async fn join_until(&mut self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline, self.join()).await.is_ok()
    }

    /// Tell both drains to stop and wait for them to hand back their buffers.
    async fn stop(&mut self) {
        let _ = self.stop.send(true);
        self.join().await;
    }

    #[allow(clippy::type_complexity)]
    async fn collect(
        self,
    ) -> (
        (Vec<u8>, Option<std::io::Error>),
        (Vec<u8>, Option<std::io::Error>),
    ) {
        (self.stdout.collect().await, self.stderr.collect().await)
    }
}

//! Agent process lifecycle.
//!
//! [`AgentProcess`] owns the spawned child together with its three stdio
//! streams:
//! - stdin and stdout live inside a [`StdioTransport`];
//! - stderr is copied into memory by a background task from the moment the
//!   process starts, so a chatty agent never blocks on a full pipe. Only the
//!   last `stderr_limit` bytes are retained.
//!
//! Release happens through [`AgentProcess::shutdown`], which consumes the
//! value: termination is requested once, then stderr and stdout are drained
//! once. If the value is dropped without a shutdown (panic, early return),
//! `kill_on_drop(true)` still reaps the child.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::acp::transport::Transport;
use crate::{AppError, Result};

/// Transport bound to a child's stdin/stdout.
pub type StdioTransport = Transport<ChildStdin, ChildStdout>;

const CHUNK_BYTES: usize = 4096;

/// Default cap on retained stderr.
pub const DEFAULT_STDERR_LIMIT: usize = 1024 * 1024;

// ── Configuration ────────────────────────────────────────────────────────────

/// How to launch the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Agent executable.
    pub program: PathBuf,
    /// Arguments, normally the protocol-mode subcommand (`acp`).
    pub args: Vec<String>,
    /// Working directory of the child.
    pub cwd: PathBuf,
    /// Extra environment variables; the harness environment is inherited.
    pub env: BTreeMap<String, String>,
    /// Stderr bytes retained; older output is dropped first.
    pub stderr_limit: usize,
}

impl SpawnConfig {
    /// `program arg1 arg2 …`, for logs and reports.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// What to do when the agent outlives its termination grace period.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPolicy {
    /// Force-kill the process and report that it was killed.
    #[default]
    Kill,
    /// Report a timeout and leave the process; it is reaped when the
    /// handle is dropped.
    Leave,
}

/// Bounds applied during [`AgentProcess::shutdown`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TeardownPolicy {
    /// Time allowed between the termination request and exit.
    pub grace: Duration,
    /// Time allowed for each stream drain.
    pub drain_timeout: Duration,
    /// Escalation rule after `grace`.
    pub on_timeout: TerminationPolicy,
}

// ── Results ──────────────────────────────────────────────────────────────────

/// How the agent process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExitState {
    /// The process exited (on its own or after the termination request).
    Exited {
        /// Exit code, if it exited normally.
        code: Option<i32>,
        /// Terminating signal, if any (Unix only).
        signal: Option<i32>,
    },
    /// The process ignored the termination request and was force-killed.
    Killed,
    /// The process was still running when teardown gave up waiting.
    StillRunning,
    /// Waiting on the process failed.
    Unknown {
        /// Failure description.
        reason: String,
    },
}

impl ExitState {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self::Exited {
            code: status.code(),
            signal,
        }
    }
}

/// Text read from a stream after the process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Drained {
    /// Everything read, lossily decoded as UTF-8.
    pub text: String,
    /// `true` when EOF was reached, `false` when the drain timed out.
    pub complete: bool,
    /// Leading bytes discarded to stay within the retention cap.
    pub dropped_bytes: usize,
}

impl Drained {
    fn from_bytes(bytes: &[u8], complete: bool) -> Self {
        Self {
            text: String::from_utf8_lossy(bytes).into_owned(),
            complete,
            dropped_bytes: 0,
        }
    }
}

/// Everything collected while releasing the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Teardown {
    /// Final process state.
    pub exit: ExitState,
    /// Captured stderr (diagnostic log of the agent).
    pub stderr: Drained,
    /// Stdout the harness never consumed as protocol messages.
    pub stdout: Drained,
    /// Set when the grace period elapsed under [`TerminationPolicy::Leave`].
    pub timeout: Option<String>,
}

// ── Process handle ───────────────────────────────────────────────────────────

/// A running agent and its stdio.
#[derive(Debug)]
pub struct AgentProcess {
    command_line: String,
    pid: Option<u32>,
    child: Child,
    transport: StdioTransport,
    stderr: StderrCapture,
    exit: Option<ExitState>,
}

impl AgentProcess {
    /// Launch the agent with piped stdio and `kill_on_drop(true)`.
    ///
    /// Must be called from within a tokio runtime (stderr capture runs as a
    /// spawned task).
    ///
    /// # Errors
    ///
    /// - `AppError::Process("failed to spawn …")`: OS spawn failure.
    /// - `AppError::Process("failed to capture agent …")`: a stdio handle
    ///   was not piped.
    pub fn spawn(config: &SpawnConfig) -> Result<Self> {
        let command_line = config.command_line();

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(&config.env)
            .current_dir(&config.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Process(format!("failed to spawn {command_line}: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Process("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Process("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Process("failed to capture agent stderr".into()))?;

        let pid = child.id();
        info!(pid = ?pid, command = command_line.as_str(), cwd = %config.cwd.display(), "agent spawned");

        Ok(Self {
            command_line,
            pid,
            child,
            transport: Transport::new(stdin, stdout),
            stderr: StderrCapture::start(stderr, config.stderr_limit),
            exit: None,
        })
    }

    /// OS process id, if the child had one at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The command line the agent was launched with.
    #[must_use]
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// The JSON-RPC transport over the agent's stdin/stdout.
    pub fn transport(&mut self) -> &mut StdioTransport {
        &mut self.transport
    }

    /// Close stdin, request termination and wait up to `grace` for exit.
    ///
    /// Only the first call signals the process; later calls return the
    /// recorded state.
    ///
    /// # Errors
    ///
    /// - `AppError::Timeout`: the grace period elapsed and `policy` is
    ///   [`TerminationPolicy::Leave`].
    /// - `AppError::Process`: the termination request could not be sent.
    pub async fn terminate(
        &mut self,
        grace: Duration,
        policy: TerminationPolicy,
    ) -> Result<ExitState> {
        if let Some(state) = &self.exit {
            return Ok(state.clone());
        }

        self.transport.close_writer().await;

        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(pid = ?self.pid, "agent already exited before termination request");
            return Ok(self.record(ExitState::from_status(status)));
        }

        if let Err(err) = request_termination(&mut self.child) {
            self.record(ExitState::Unknown {
                reason: err.to_string(),
            });
            return Err(err);
        }
        info!(pid = ?self.pid, ?grace, "termination requested");

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = ?self.pid, ?status, "agent exited");
                Ok(self.record(ExitState::from_status(status)))
            }
            Ok(Err(err)) => {
                warn!(pid = ?self.pid, %err, "error waiting for agent process");
                Ok(self.record(ExitState::Unknown {
                    reason: format!("wait error: {err}"),
                }))
            }
            Err(_elapsed) => match policy {
                TerminationPolicy::Kill => {
                    warn!(pid = ?self.pid, "agent ignored termination request, forcing kill");
                    let killed = self.child.kill().await;
                    if let Err(err) = &killed {
                        warn!(pid = ?self.pid, %err, "failed to force-kill agent process");
                    }
                    Ok(self.record(kill_outcome(killed)))
                }
                TerminationPolicy::Leave => {
                    self.record(ExitState::StillRunning);
                    Err(AppError::Timeout(format!(
                        "agent did not exit within {grace:?} of the termination request"
                    )))
                }
            },
        }
    }

    /// Terminate the agent, then drain stderr and stdout. Runs once: the
    /// process handle is consumed.
    pub async fn shutdown(mut self, policy: &TeardownPolicy) -> Teardown {
        let (exit, timeout) = match self.terminate(policy.grace, policy.on_timeout).await {
            Ok(state) => (state, None),
            Err(AppError::Timeout(msg)) => (ExitState::StillRunning, Some(msg)),
            Err(err) => (
                ExitState::Unknown {
                    reason: err.to_string(),
                },
                None,
            ),
        };

        let stderr = self.stderr.finish(policy.drain_timeout).await;
        let stdout = self.transport.drain_stdout(policy.drain_timeout).await;

        info!(
            pid = ?self.pid,
            ?exit,
            stderr_bytes = stderr.text.len(),
            stdout_bytes = stdout.text.len(),
            "agent released"
        );

        Teardown {
            exit,
            stderr,
            stdout,
            timeout,
        }
    }

    fn record(&mut self, state: ExitState) -> ExitState {
        self.exit = Some(state.clone());
        state
    }
}

fn kill_outcome(result: std::io::Result<()>) -> ExitState {
    match result {
        Ok(()) => ExitState::Killed,
        Err(err) => ExitState::Unknown {
            reason: format!("force-kill failed: {err}"),
        },
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // `None` once the child has been reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let raw = i32::try_from(pid).map_err(|_| AppError::Process(format!("pid {pid} out of range")))?;

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(AppError::Process(format!("failed to send SIGTERM: {err}"))),
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> Result<()> {
    child
        .start_kill()
        .map_err(|err| AppError::Process(format!("failed to request termination: {err}")))
}

// ── Stream draining ──────────────────────────────────────────────────────────

/// Read everything left on `stream` until EOF or until `timeout` elapses.
///
/// Bytes read before the deadline are kept even when the drain times out,
/// so a grandchild holding the pipe open cannot hide the output.
pub async fn drain<R>(mut stream: R, timeout: Duration) -> Drained
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut bytes = Vec::new();
    let mut chunk = [0_u8; CHUNK_BYTES];

    let complete = loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break true,
            Ok(Ok(n)) => bytes.extend_from_slice(&chunk[..n]),
            Ok(Err(err)) => {
                warn!(%err, "drain stopped on read error");
                break false;
            }
            Err(_elapsed) => break false,
        }
    };

    Drained::from_bytes(&bytes, complete)
}

/// Keeps the most recent `limit` bytes written to it.
#[derive(Debug)]
struct TailBuffer {
    bytes: VecDeque<u8>,
    limit: usize,
    dropped: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        let excess = self.bytes.len().saturating_sub(self.limit);
        if excess > 0 {
            self.bytes.drain(..excess);
            self.dropped += excess;
        }
    }

    fn take(&mut self, complete: bool) -> Drained {
        let bytes: Vec<u8> = std::mem::take(&mut self.bytes).into();
        Drained {
            dropped_bytes: self.dropped,
            ..Drained::from_bytes(&bytes, complete)
        }
    }
}

/// Continuous stderr copy into a shared tail buffer.
#[derive(Debug)]
struct StderrCapture {
    buffer: Arc<Mutex<TailBuffer>>,
    task: JoinHandle<()>,
}

impl StderrCapture {
    fn start(mut stderr: ChildStderr, limit: usize) -> Self {
        let buffer = Arc::new(Mutex::new(TailBuffer::new(limit)));
        let sink = Arc::clone(&buffer);

        let task = tokio::spawn(async move {
            let mut chunk = [0_u8; CHUNK_BYTES];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().await.push(&chunk[..n]),
                    Err(err) => {
                        warn!(%err, "stderr capture stopped on read error");
                        break;
                    }
                }
            }
        });

        Self { buffer, task }
    }

    /// Wait for stderr EOF up to `timeout`, then hand over what was captured.
    async fn finish(mut self, timeout: Duration) -> Drained {
        let complete = tokio::time::timeout(timeout, &mut self.task).await.is_ok();
        if !complete {
            self.task.abort();
        }
        let drained = self.buffer.lock().await.take(complete);
        if drained.dropped_bytes > 0 {
            debug!(dropped = drained.dropped_bytes, "stderr capture truncated to its tail");
        }
        drained
    }
}

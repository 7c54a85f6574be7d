//! Run report and soft verdict.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::acp::client::{PromptExchange, PromptOutcome};
use crate::acp::process::{Drained, ExitState, Teardown};
use crate::acp::prompt::StopReason;
use crate::harness::Exchange;
use crate::mode::RunMode;
use crate::{AppError, Result};

/// Identity of the agent process of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    /// Program and arguments.
    pub command: String,
    /// OS process id.
    pub pid: Option<u32>,
    /// Working directory.
    pub cwd: PathBuf,
}

/// Everything observed during one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// The agent that was driven.
    pub agent: AgentSummary,
    /// Prompt submission strategy.
    pub mode: RunMode,
    /// When the agent was spawned.
    pub started_at: DateTime<Utc>,
    /// When teardown completed.
    pub finished_at: DateTime<Utc>,
    /// Handshake, session and prompt results.
    pub exchange: Exchange,
    /// First error of the run, if any.
    pub failure: Option<String>,
    /// Process exit state and drained streams.
    pub teardown: Teardown,
}

/// Soft outcome of a run. Informational only; it never sets the exit code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    /// A prompt reached a recognised stop reason.
    Completed(StopReason),
    /// Nothing failed, but no prompt reached a recognised stop reason.
    Unresolved,
    /// A step failed.
    Failed(String),
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(reason) => write!(f, "completed ({reason})"),
            Self::Unresolved => f.write_str("unresolved"),
            Self::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

impl RunReport {
    /// Failure first, then the first recognised stop reason, else unresolved.
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        if let Some(failure) = &self.failure {
            return Verdict::Failed(failure.clone());
        }
        self.prompt_outcomes()
            .filter_map(|outcome| outcome.stop_reason.as_ref())
            .find(|reason| reason.is_known())
            .map_or(Verdict::Unresolved, |reason| Verdict::Completed(reason.clone()))
    }

    /// Every prompt outcome of the run, probe attempts included.
    pub fn prompt_outcomes(&self) -> impl Iterator<Item = &PromptOutcome> {
        self.exchanges().flat_map(|exchange| exchange.outcomes.iter())
    }

    /// The report and its verdict as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&json!({
            "verdict": self.verdict(),
            "report": self,
        }))
        .map_err(|err| AppError::Transport(format!("failed to serialise report: {err}")))
    }

    fn exchanges(&self) -> impl Iterator<Item = &PromptExchange> {
        self.exchange.prompts.iter().chain(
            self.exchange
                .probe
                .iter()
                .flat_map(|probe| probe.attempts.iter()),
        )
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.agent.pid {
            Some(pid) => writeln!(f, "agent:       {} (pid {pid})", self.agent.command)?,
            None => writeln!(f, "agent:       {}", self.agent.command)?,
        }
        writeln!(f, "cwd:         {}", self.agent.cwd.display())?;
        writeln!(f, "mode:        {}", self.mode)?;
        writeln!(f, "started:     {}", self.started_at.to_rfc3339())?;
        writeln!(f, "finished:    {}", self.finished_at.to_rfc3339())?;

        match &self.exchange.initialize {
            Some(init) => match init.protocol_version {
                Some(version) => writeln!(
                    f,
                    "initialize:  ok (id {}, protocolVersion {version})",
                    init.request_id
                )?,
                None => writeln!(f, "initialize:  ok (id {})", init.request_id)?,
            },
            None => writeln!(f, "initialize:  not completed")?,
        }
        match &self.exchange.session {
            Some(session) => writeln!(f, "session:     {}", session.session_id)?,
            None => writeln!(f, "session:     not created")?,
        }

        for exchange in &self.exchange.prompts {
            write_exchange(f, exchange)?;
        }
        if let Some(probe) = &self.exchange.probe {
            for attempt in &probe.attempts {
                write_exchange(f, attempt)?;
            }
            match probe.accepted {
                Some(shape) => writeln!(f, "probe:       accepted {shape}")?,
                None => writeln!(f, "probe:       no shape accepted")?,
            }
        }

        if let Some(failure) = &self.failure {
            writeln!(f, "failure:     {failure}")?;
        }
        writeln!(f, "verdict:     {}", self.verdict())?;
        writeln!(f, "exit:        {}", exit_label(&self.teardown.exit))?;
        if let Some(timeout) = &self.teardown.timeout {
            writeln!(f, "termination: {timeout}")?;
        }

        write_stream(f, "agent stderr", &self.teardown.stderr)?;
        write_stream(f, "remaining stdout", &self.teardown.stdout)
    }
}

fn write_exchange(f: &mut Formatter<'_>, exchange: &PromptExchange) -> std::fmt::Result {
    let collection = &exchange.collection;
    for outcome in &exchange.outcomes {
        write!(f, "prompt:      id {} [{}] ", outcome.request_id, outcome.shape)?;
        match (&outcome.stop_reason, &outcome.error) {
            (Some(reason), _) if reason.is_known() => writeln!(f, "stopReason {reason}")?,
            (Some(reason), _) => writeln!(f, "unrecognised stopReason {reason:?}")?,
            (None, Some(err)) => writeln!(f, "error {} {}", err.code, err.message)?,
            (None, None) if outcome.resolved => writeln!(f, "answered without stopReason")?,
            (None, None) => writeln!(f, "unresolved")?,
        }
    }
    writeln!(
        f,
        "             {} line(s), {} notification(s), {} other message(s), stop {}",
        collection.lines_read,
        collection.notifications().count(),
        collection.observed.len() - collection.notifications().count(),
        collection.stop
    )
}

fn write_stream(f: &mut Formatter<'_>, name: &str, stream: &Drained) -> std::fmt::Result {
    let state = if stream.complete { "" } else { ", truncated" };
    let dropped = if stream.dropped_bytes > 0 {
        format!(", {} earlier bytes dropped", stream.dropped_bytes)
    } else {
        String::new()
    };
    writeln!(f, "--- {name} ({} bytes{state}{dropped}) ---", stream.text.len())?;
    if !stream.text.is_empty() {
        f.write_str(&stream.text)?;
        if !stream.text.ends_with('\n') {
            writeln!(f)?;
        }
    }
    Ok(())
}

fn exit_label(exit: &ExitState) -> String {
    match exit {
        ExitState::Exited {
            code: Some(code), ..
        } => format!("exited with code {code}"),
        ExitState::Exited {
            signal: Some(signal),
            ..
        } => format!("terminated by signal {signal}"),
        ExitState::Exited { .. } => "exited".into(),
        ExitState::Killed => "killed after grace period".into(),
        ExitState::StillRunning => "still running".into(),
        ExitState::Unknown { reason } => format!("unknown ({reason})"),
    }
}

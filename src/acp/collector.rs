//! Bounded response collection.
//!
//! After a request is sent, the agent may emit any number of notifications
//! (typically `session/update`) before the response that carries the
//! request's id. [`ResponseCollector`] reads at most `max_messages` lines,
//! records everything that is not the awaited response, and stops on the
//! first of:
//!
//! | Condition                                   | [`StopCondition`]    |
//! |---------------------------------------------|----------------------|
//! | every awaited id has a result or error      | `Terminal`           |
//! | `max_messages` lines read                   | `BudgetExhausted`    |
//! | agent stdout reached EOF                    | `StreamClosed`       |
//! | no line within the per-read timeout         | `ReadTimeout`        |
//! | cancellation token fired                    | `Cancelled`          |
//!
//! Only the first is a resolved outcome; the others are reported, not
//! raised. A refusal that cannot be written back means the agent stopped
//! reading and also ends collection as `StreamClosed`. A line that is not
//! JSON aborts collection with
//! [`AppError::Transport`](crate::AppError::Transport), naming the awaited
//! ids and the lines already read.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::message::{JsonRpcMessage, Notification, Request, RequestId, Response, METHOD_NOT_FOUND};
use crate::acp::transport::{Received, Transport};
use crate::{AppError, Result};

/// Why a collection ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCondition {
    /// All awaited responses arrived.
    Terminal,
    /// The line budget ran out first.
    BudgetExhausted,
    /// The agent closed stdout first.
    StreamClosed,
    /// A single read waited longer than the read timeout.
    ReadTimeout,
    /// The run was cancelled.
    Cancelled,
}

impl Display for StopCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Terminal => "terminal",
            Self::BudgetExhausted => "budget_exhausted",
            Self::StreamClosed => "stream_closed",
            Self::ReadTimeout => "read_timeout",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Everything read while waiting for one or more responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collection {
    /// Ids that were awaited, in request order.
    pub pending: Vec<RequestId>,
    /// Terminal responses, in arrival order.
    pub responses: Vec<Response>,
    /// Every other message, in arrival order.
    pub observed: Vec<JsonRpcMessage>,
    /// Lines consumed from the budget (blank lines included).
    pub lines_read: usize,
    /// Why collection ended.
    pub stop: StopCondition,
}

impl Collection {
    /// Terminal response for `id`, if it arrived.
    #[must_use]
    pub fn terminal_for(&self, id: &RequestId) -> Option<&Response> {
        self.responses.iter().find(|resp| resp.answers(id))
    }

    /// Terminal response for the first awaited id.
    #[must_use]
    pub fn terminal(&self) -> Option<&Response> {
        self.pending.first().and_then(|id| self.terminal_for(id))
    }

    /// Whether every awaited id was answered.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.stop == StopCondition::Terminal
    }

    /// Notifications observed while waiting.
    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.observed.iter().filter_map(|msg| match msg {
            JsonRpcMessage::Notification(note) => Some(note),
            _ => None,
        })
    }

    /// Turn an unresolved collection into the error a step that requires a
    /// response should report.
    #[must_use]
    pub fn unresolved_error(&self, method: &str) -> AppError {
        let ids = self
            .pending
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        match self.stop {
            StopCondition::StreamClosed => AppError::Transport(format!(
                "agent closed stdout before answering {method} (id {ids})"
            )),
            StopCondition::Cancelled => {
                AppError::Timeout(format!("cancelled while waiting for {method} (id {ids})"))
            }
            _ => AppError::Timeout(format!(
                "no response to {method} (id {ids}) after {} line(s): {}",
                self.lines_read, self.stop
            )),
        }
    }
}

/// Read-side bounds shared by every collection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CollectLimits {
    /// Maximum lines read per collection.
    pub max_messages: usize,
    /// Maximum wait for any single line.
    pub read_timeout: Duration,
    /// Answer agent-initiated requests with `-32601`.
    pub reject_agent_requests: bool,
}

/// Correlates pending ids with what arrives on the wire.
#[derive(Debug)]
struct ResponseWaitState {
    pending: Vec<RequestId>,
    unanswered: HashSet<RequestId>,
    responses: Vec<Response>,
    observed: Vec<JsonRpcMessage>,
    lines_read: usize,
}

impl ResponseWaitState {
    fn new(ids: &[RequestId]) -> Self {
        Self {
            pending: ids.to_vec(),
            unanswered: ids.iter().cloned().collect(),
            responses: Vec::new(),
            observed: Vec::new(),
            lines_read: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.unanswered.is_empty()
    }

    fn offer(&mut self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(resp)
                if resp.id.as_ref().is_some_and(|id| self.unanswered.contains(id)) =>
            {
                if let Some(id) = &resp.id {
                    self.unanswered.remove(id);
                }
                self.responses.push(resp);
            }
            other => self.observed.push(other),
        }
    }

    fn interrupted(&self, err: AppError) -> AppError {
        match err {
            AppError::Transport(msg) => {
                let ids = self
                    .pending
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                AppError::Transport(format!(
                    "{msg} (waiting for id {ids}, {} line(s) read, {} observed)",
                    self.lines_read,
                    self.observed.len()
                ))
            }
            other => other,
        }
    }

    fn finish(self, stop: StopCondition) -> Collection {
        Collection {
            pending: self.pending,
            responses: self.responses,
            observed: self.observed,
            lines_read: self.lines_read,
            stop,
        }
    }
}

/// Reads responses for in-flight requests within fixed bounds.
#[derive(Debug, Clone)]
pub struct ResponseCollector {
    limits: CollectLimits,
}

impl ResponseCollector {
    /// Collector with the given bounds.
    #[must_use]
    pub fn new(limits: CollectLimits) -> Self {
        Self { limits }
    }

    /// Configured bounds.
    #[must_use]
    pub fn limits(&self) -> &CollectLimits {
        &self.limits
    }

    /// Read up to `max_messages` lines looking for the response to
    /// `request_id`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Transport`]: a line was not JSON or was too long.
    pub async fn collect<W, R>(
        &self,
        transport: &mut Transport<W, R>,
        request_id: &RequestId,
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> Result<Collection>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        self.collect_all(transport, std::slice::from_ref(request_id), max_messages, cancel)
            .await
    }

    /// Read up to `max_messages` lines until every id in `ids` is answered.
    ///
    /// # Errors
    ///
    /// Same as [`collect`](Self::collect).
    pub async fn collect_all<W, R>(
        &self,
        transport: &mut Transport<W, R>,
        ids: &[RequestId],
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> Result<Collection>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let mut state = ResponseWaitState::new(ids);

        let stop = loop {
            if state.is_complete() {
                break StopCondition::Terminal;
            }
            if state.lines_read >= max_messages {
                break StopCondition::BudgetExhausted;
            }

            let received = match transport
                .receive_within(self.limits.read_timeout, cancel)
                .await
            {
                Ok(received) => received,
                Err(err) => return Err(state.interrupted(err)),
            };

            match received {
                Received::Closed => break StopCondition::StreamClosed,
                Received::TimedOut => break StopCondition::ReadTimeout,
                Received::Cancelled => break StopCondition::Cancelled,
                Received::Blank => state.lines_read += 1,
                Received::Message(message) => {
                    state.lines_read += 1;
                    let refused = match &message {
                        JsonRpcMessage::Request(req) => self.answer_agent_request(transport, req).await,
                        _ => Ok(()),
                    };
                    state.offer(message);
                    if let Err(err) = refused {
                        warn!(%err, "collector: agent stopped reading stdin");
                        break StopCondition::StreamClosed;
                    }
                }
            }
        };

        let collection = state.finish(stop);
        if collection.is_resolved() {
            debug!(
                ids = ?collection.pending,
                lines = collection.lines_read,
                observed = collection.observed.len(),
                "collector: resolved"
            );
        } else {
            info!(
                ids = ?collection.pending,
                lines = collection.lines_read,
                stop = ?collection.stop,
                "collector: ended without a terminal response"
            );
        }
        Ok(collection)
    }

    async fn answer_agent_request<W, R>(
        &self,
        transport: &mut Transport<W, R>,
        req: &Request,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        if !self.limits.reject_agent_requests {
            debug!(method = req.method.as_str(), id = %req.id, "collector: agent request left unanswered");
            return Ok(());
        }
        warn!(method = req.method.as_str(), id = %req.id, "collector: refusing agent-initiated request");
        let refusal = JsonRpcMessage::error_response(
            req.id.clone(),
            METHOD_NOT_FOUND,
            format!("method not supported by harness: {}", req.method),
        );
        transport.send(&refusal).await
    }
}

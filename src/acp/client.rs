//! ACP client: handshake, session creation and prompt submission.
//!
//! A run follows the ACP choreography:
//!
//! 1. **`initialize`**: announces `protocolVersion`, `clientCapabilities`
//!    and `clientInfo`. Any response with a `result` counts as success.
//! 2. **`session/new`**: sends `cwd` and `mcpServers`; the response must
//!    carry `result.sessionId`.
//! 3. **`session/prompt`**: sends the prompt for that session; zero or
//!    more `session/update` notifications precede a response whose result
//!    may hold `stopReason`.
//!
//! Every request gets the next id from one counter, so ids within a run
//! are unique and increasing. Reads go through [`ResponseCollector`] and
//! are bounded by the configured budget, read timeout and cancellation
//! token.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::collector::{Collection, CollectLimits, ResponseCollector, StopCondition};
use crate::acp::message::{JsonRpcMessage, RequestId, Response, RpcError};
use crate::acp::prompt::{PromptShape, StopReason};
use crate::acp::transport::Transport;
use crate::{AppError, Result};

/// Method name of the handshake request.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Method name of the session-creation request.
pub const METHOD_SESSION_NEW: &str = "session/new";
/// Method name of the prompt request.
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";

// ── Request parameters ───────────────────────────────────────────────────────

/// `clientInfo` of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: String,
}

/// File-system capabilities advertised to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    /// Client can serve `fs/read_text_file`.
    pub read_text_file: bool,
    /// Client can serve `fs/write_text_file`.
    pub write_text_file: bool,
}

/// `clientCapabilities` of the `initialize` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientCapabilities {
    /// File-system capabilities.
    pub fs: FsCapabilities,
    /// Client can run terminals for the agent.
    pub terminal: bool,
}

/// Full `initialize` parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version proposed by the client.
    pub protocol_version: u32,
    /// Capabilities offered to the agent.
    pub client_capabilities: ClientCapabilities,
    /// Client identification.
    pub client_info: ClientInfo,
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

/// Successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitializeOutcome {
    /// Id of the `initialize` request.
    pub request_id: RequestId,
    /// `result.protocolVersion`, when the agent reported one.
    pub protocol_version: Option<i64>,
    /// Full `result` member.
    pub result: Value,
}

/// An established ACP session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Agent-assigned session id.
    pub session_id: String,
}

/// What happened to one prompt request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptOutcome {
    /// Id of the `session/prompt` request.
    pub request_id: RequestId,
    /// Encoding used for the prompt parameters.
    pub shape: PromptShape,
    /// Whether a terminal response arrived for this request.
    pub resolved: bool,
    /// `result.stopReason`, if the response carried one.
    pub stop_reason: Option<StopReason>,
    /// `error` member, if the agent rejected the prompt.
    pub error: Option<RpcError>,
}

impl PromptOutcome {
    fn new(request_id: RequestId, shape: PromptShape, terminal: Option<&Response>) -> Self {
        Self {
            request_id,
            shape,
            resolved: terminal.is_some(),
            stop_reason: terminal
                .and_then(Response::result)
                .and_then(StopReason::from_result),
            error: terminal.and_then(Response::error).cloned(),
        }
    }

    /// A terminal response with a `result` arrived.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.resolved && self.error.is_none()
    }
}

/// One or more prompt requests and the stream read for them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptExchange {
    /// One outcome per request, in send order.
    pub outcomes: Vec<PromptOutcome>,
    /// Everything read while waiting.
    pub collection: Collection,
}

/// Result of trying the prompt shapes in [`PromptShape::PROBE_ORDER`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapeProbe {
    /// First shape that produced a `result`, if any.
    pub accepted: Option<PromptShape>,
    /// Every attempt, in order.
    pub attempts: Vec<PromptExchange>,
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Tunables for [`ProtocolClient`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClientOptions {
    /// Bounds for every collection.
    pub limits: CollectLimits,
    /// Fixed pause between sending and the first read; zero disables it.
    pub settle: Duration,
}

/// Issues ACP requests over a borrowed [`Transport`].
#[derive(Debug)]
pub struct ProtocolClient<'t, W, R> {
    transport: &'t mut Transport<W, R>,
    collector: ResponseCollector,
    settle: Duration,
    cancel: CancellationToken,
    next_id: i64,
    issued: Vec<RequestId>,
}

impl<'t, W, R> ProtocolClient<'t, W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    /// Client over `transport`; ids start at 1.
    #[must_use]
    pub fn new(
        transport: &'t mut Transport<W, R>,
        options: ClientOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            collector: ResponseCollector::new(options.limits),
            settle: options.settle,
            cancel,
            next_id: 1,
            issued: Vec::new(),
        }
    }

    /// Every id issued so far, in order.
    #[must_use]
    pub fn issued_ids(&self) -> &[RequestId] {
        &self.issued
    }

    /// Perform the `initialize` handshake.
    ///
    /// # Errors
    ///
    /// - `AppError::Protocol`: the agent answered with an `error`.
    /// - `AppError::Timeout`: no response within the budget or read timeout.
    /// - `AppError::Transport`: malformed output or stream closed.
    pub async fn initialize(&mut self, params: &InitializeParams) -> Result<InitializeOutcome> {
        let params = serde_json::to_value(params)
            .map_err(|e| AppError::Transport(format!("failed to serialise initialize: {e}")))?;
        let (request_id, response) = self.call(METHOD_INITIALIZE, params).await?;

        let result = require_result(METHOD_INITIALIZE, &response)?.clone();
        let protocol_version = result.get("protocolVersion").and_then(Value::as_i64);
        info!(%request_id, ?protocol_version, "handshake: initialize accepted");

        Ok(InitializeOutcome {
            request_id,
            protocol_version,
            result,
        })
    }

    /// Create a session rooted at `cwd`.
    ///
    /// # Errors
    ///
    /// - `AppError::Protocol`: error response, or `result.sessionId`
    ///   missing, not a string, or empty.
    /// - `AppError::Timeout` / `AppError::Transport`: as for
    ///   [`initialize`](Self::initialize).
    pub async fn create_session(&mut self, cwd: &Path, mcp_servers: &[Value]) -> Result<Session> {
        let params = json!({
            "cwd": cwd.to_string_lossy(),
            "mcpServers": mcp_servers,
        });
        let (request_id, response) = self.call(METHOD_SESSION_NEW, params).await?;

        let result = require_result(METHOD_SESSION_NEW, &response)?;
        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AppError::Protocol(format!(
                    "{METHOD_SESSION_NEW} response (id {request_id}) missing result.sessionId"
                ))
            })?;

        info!(%request_id, session_id, "handshake: session created");
        Ok(Session {
            session_id: session_id.to_owned(),
        })
    }

    /// Send `text` to `session` using the canonical encoding and collect
    /// the stream until the terminal response or the budget runs out.
    ///
    /// An unresolved collection is returned, not raised.
    ///
    /// # Errors
    ///
    /// `AppError::Transport` on malformed output or a broken pipe.
    pub async fn prompt(&mut self, session: &Session, text: &str) -> Result<PromptExchange> {
        self.prompt_with(session, text, PromptShape::ContentBlocks)
            .await
    }

    /// [`prompt`](Self::prompt) with an explicit payload shape.
    ///
    /// # Errors
    ///
    /// Same as [`prompt`](Self::prompt).
    pub async fn prompt_with(
        &mut self,
        session: &Session,
        text: &str,
        shape: PromptShape,
    ) -> Result<PromptExchange> {
        let request_id = self
            .send_request(METHOD_SESSION_PROMPT, shape.params(&session.session_id, text))
            .await?;
        let collection = self.collect(std::slice::from_ref(&request_id), 1).await?;
        let outcome = PromptOutcome::new(request_id, shape, collection.terminal());

        log_outcome(&outcome, &collection);
        Ok(PromptExchange {
            outcomes: vec![outcome],
            collection,
        })
    }

    /// Try each shape in [`PromptShape::PROBE_ORDER`], one request at a
    /// time, until one is answered with a `result`.
    ///
    /// Probing stops early if the agent closes stdout or the run is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`prompt`](Self::prompt).
    pub async fn probe_prompt_shapes(&mut self, session: &Session, text: &str) -> Result<ShapeProbe> {
        let mut attempts = Vec::new();
        let mut accepted = None;

        for shape in PromptShape::PROBE_ORDER {
            let exchange = self.prompt_with(session, text, shape).await?;
            let stop = exchange.collection.stop;
            let ok = exchange.outcomes.iter().any(PromptOutcome::is_accepted);
            attempts.push(exchange);

            if ok {
                info!(%shape, "probe: shape accepted");
                accepted = Some(shape);
                break;
            }
            if matches!(stop, StopCondition::StreamClosed | StopCondition::Cancelled) {
                warn!(%shape, ?stop, "probe: stopping early");
                break;
            }
            debug!(%shape, "probe: shape not accepted");
        }

        Ok(ShapeProbe { accepted, attempts })
    }

    /// Send one prompt per entry of `texts` back-to-back, then collect all
    /// responses together with a budget of `max_messages` per prompt.
    ///
    /// # Errors
    ///
    /// Same as [`prompt`](Self::prompt).
    pub async fn fire_prompts(&mut self, session: &Session, texts: &[String]) -> Result<PromptExchange> {
        let shape = PromptShape::ContentBlocks;
        let mut ids = Vec::with_capacity(texts.len());
        for text in texts {
            let id = self
                .send_request(METHOD_SESSION_PROMPT, shape.params(&session.session_id, text))
                .await?;
            ids.push(id);
        }

        let collection = self.collect(&ids, texts.len()).await?;
        let outcomes = ids
            .into_iter()
            .map(|id| {
                let terminal = collection.terminal_for(&id);
                PromptOutcome::new(id, shape, terminal)
            })
            .collect::<Vec<_>>();

        for outcome in &outcomes {
            log_outcome(outcome, &collection);
        }
        Ok(PromptExchange {
            outcomes,
            collection,
        })
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId::Number(self.next_id);
        self.next_id += 1;
        self.issued.push(id.clone());
        id
    }

    async fn send_request(&mut self, method: &str, params: Value) -> Result<RequestId> {
        let id = self.next_request_id();
        self.transport
            .send(&JsonRpcMessage::request(id.clone(), method, params))
            .await?;
        debug!(%id, method, "request sent");
        Ok(id)
    }

    async fn collect(&mut self, ids: &[RequestId], requests: usize) -> Result<Collection> {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        let budget = self
            .collector
            .limits()
            .max_messages
            .saturating_mul(requests.max(1));
        self.collector
            .collect_all(self.transport, ids, budget, &self.cancel)
            .await
    }

    /// Send a request that must be answered and return its response.
    async fn call(&mut self, method: &str, params: Value) -> Result<(RequestId, Response)> {
        let id = self.send_request(method, params).await?;
        let collection = self.collect(std::slice::from_ref(&id), 1).await?;
        if !collection.observed.is_empty() {
            debug!(
                %id,
                method,
                observed = collection.observed.len(),
                "messages interleaved before response"
            );
        }
        match collection.terminal() {
            Some(response) => Ok((id, response.clone())),
            None => Err(collection.unresolved_error(method)),
        }
    }
}

fn require_result<'a>(method: &str, response: &'a Response) -> Result<&'a Value> {
    if let Some(err) = response.error() {
        return Err(AppError::Protocol(format!(
            "{method} failed: {} (code {})",
            err.message, err.code
        )));
    }
    response
        .result()
        .ok_or_else(|| AppError::Protocol(format!("{method} response has no result")))
}

fn log_outcome(outcome: &PromptOutcome, collection: &Collection) {
    let notifications = collection.notifications().count();
    match (&outcome.stop_reason, &outcome.error) {
        (Some(reason), _) => info!(
            id = %outcome.request_id,
            shape = %outcome.shape,
            stop_reason = %reason,
            notifications,
            "prompt completed"
        ),
        (None, Some(err)) => warn!(
            id = %outcome.request_id,
            shape = %outcome.shape,
            code = err.code,
            message = err.message.as_str(),
            "prompt rejected"
        ),
        (None, None) if outcome.resolved => info!(
            id = %outcome.request_id,
            shape = %outcome.shape,
            notifications,
            "prompt answered without stopReason"
        ),
        (None, None) => warn!(
            id = %outcome.request_id,
            shape = %outcome.shape,
            stop = ?collection.stop,
            notifications,
            "prompt unresolved"
        ),
    }
}

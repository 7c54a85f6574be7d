#![forbid(unsafe_code)]

//! `acp-mock-agent`: scriptable ACP agent used to exercise `acp-harness`.
//!
//! Reads JSON-RPC lines on stdin and answers `initialize`, `session/new`
//! and `session/prompt` on stdout. Flags make it misbehave in the ways a
//! real agent can: reject prompt shapes, stay silent, exit mid-turn, omit
//! the session id, or ignore SIGTERM. Diagnostics go to stderr.

use std::collections::HashSet;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

type BoxResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const PARSE_ERROR: i64 = -32700;

#[derive(Debug, Parser)]
#[command(
    name = "acp-mock-agent",
    about = "Scriptable ACP agent for harness tests",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the Agent Client Protocol on stdio.
    Acp(AgentArgs),
}

/// Prompt payload shape, as the agent sees it on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
#[value(rename_all = "snake_case")]
enum Shape {
    /// `prompt: [{type, text}]`.
    ContentBlocks,
    /// `messages: [{role, content}]`.
    Messages,
    /// `message: {role, content}`.
    Message,
    /// `prompt: "<text>"`.
    Text,
    /// Accept every shape above.
    Any,
}

#[derive(Debug, Clone, Args)]
#[allow(clippy::struct_excessive_bools)]
struct AgentArgs {
    /// Prompt shape answered with a result; others get `-32602`.
    #[arg(long, value_enum, default_value_t = Shape::ContentBlocks)]
    accept: Shape,

    /// `session/update` notifications sent before each prompt response.
    #[arg(long, default_value_t = 3)]
    updates: usize,

    /// `stopReason` reported in prompt responses.
    #[arg(long, default_value = "end_turn")]
    stop_reason: String,

    /// Before each prompt response, send an agent-initiated
    /// `session/request_permission` and wait for the client's answer.
    #[arg(long)]
    request_permission: bool,

    /// Never answer `session/prompt`.
    #[arg(long)]
    silent_prompts: bool,

    /// Never write anything to stdout.
    #[arg(long)]
    mute: bool,

    /// Exit as soon as a `session/prompt` arrives, without answering.
    #[arg(long)]
    exit_on_prompt: bool,

    /// Answer `session/new` without `sessionId`.
    #[arg(long)]
    omit_session_id: bool,

    /// Keep running after SIGTERM and after stdin closes.
    #[arg(long)]
    ignore_sigterm: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Flow {
    Continue,
    Exit,
}

struct MockAgent {
    args: AgentArgs,
    stdin: Lines<BufReader<Stdin>>,
    stdout: Stdout,
    sessions: HashSet<String>,
    outbound_requests: u64,
}

impl MockAgent {
    fn new(args: AgentArgs) -> Self {
        Self {
            args,
            stdin: BufReader::new(tokio::io::stdin()).lines(),
            stdout: tokio::io::stdout(),
            sessions: HashSet::new(),
            outbound_requests: 0,
        }
    }

    async fn next_line(&mut self) -> BoxResult<Option<String>> {
        Ok(self.stdin.next_line().await?)
    }

    async fn handle_line(&mut self, line: &str) -> BoxResult<Flow> {
        if line.trim().is_empty() {
            return Ok(Flow::Continue);
        }
        let msg: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "unparseable input line");
                self.reply_error(Value::Null, PARSE_ERROR, "parse error").await?;
                return Ok(Flow::Continue);
            }
        };

        let id = msg.get("id").filter(|id| !id.is_null()).cloned();
        let method = msg.get("method").and_then(Value::as_str);
        match (method, id) {
            (Some(method), Some(id)) => self.dispatch(method, id, &msg).await,
            (Some(method), None) => {
                info!(method, "notification from client");
                Ok(Flow::Continue)
            }
            (None, Some(id)) => {
                let code = msg.pointer("/error/code").and_then(Value::as_i64);
                info!(%id, ?code, "client answered request");
                Ok(Flow::Continue)
            }
            (None, None) => {
                warn!(%msg, "message without id or method");
                Ok(Flow::Continue)
            }
        }
    }

    async fn dispatch(&mut self, method: &str, id: Value, msg: &Value) -> BoxResult<Flow> {
        let params = msg.get("params").cloned().unwrap_or(Value::Null);
        match method {
            "initialize" => {
                let result = json!({
                    "protocolVersion": 1,
                    "agentCapabilities": {
                        "loadSession": false,
                        "promptCapabilities": {
                            "image": false,
                            "audio": false,
                            "embeddedContext": false,
                        },
                    },
                    "agentInfo": {
                        "name": "acp-mock-agent",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "authMethods": [],
                });
                self.reply(id, result).await?;
            }
            "session/new" => {
                let session_id = uuid::Uuid::new_v4().to_string();
                info!(session_id, "session created");
                self.sessions.insert(session_id.clone());
                let result = if self.args.omit_session_id {
                    json!({})
                } else {
                    json!({ "sessionId": session_id })
                };
                self.reply(id, result).await?;
            }
            "session/prompt" => return self.prompt(id, &params).await,
            other => {
                warn!(method = other, "unknown method");
                self.reply_error(id, METHOD_NOT_FOUND, &format!("method not found: {other}"))
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn prompt(&mut self, id: Value, params: &Value) -> BoxResult<Flow> {
        if self.args.exit_on_prompt {
            warn!("exiting on prompt");
            return Ok(Flow::Exit);
        }

        let Some((shape, text)) = detect_shape(params) else {
            self.reply_error(id, INVALID_PARAMS, "unrecognised prompt shape")
                .await?;
            return Ok(Flow::Continue);
        };
        if self.args.accept != Shape::Any && self.args.accept != shape {
            warn!(?shape, "prompt shape not accepted");
            self.reply_error(id, INVALID_PARAMS, &format!("prompt shape {shape:?} not accepted"))
                .await?;
            return Ok(Flow::Continue);
        }

        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if !self.sessions.contains(&session_id) {
            self.reply_error(id, INVALID_PARAMS, &format!("unknown session: {session_id:?}"))
                .await?;
            return Ok(Flow::Continue);
        }

        if self.args.silent_prompts {
            info!(%id, "ignoring prompt");
            return Ok(Flow::Continue);
        }

        if self.args.request_permission && self.ask_permission(&session_id).await? == Flow::Exit {
            return Ok(Flow::Exit);
        }

        for chunk in 0..self.args.updates {
            let update = json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": session_id,
                    "update": {
                        "sessionUpdate": "agent_message_chunk",
                        "content": { "type": "text", "text": format!("chunk {chunk}") },
                    },
                },
            });
            self.write(&update).await?;
        }

        let result = json!({
            "stopReason": self.args.stop_reason,
            "content": [{ "type": "text", "text": format!("echo: {text}") }],
        });
        self.reply(id, result).await?;
        Ok(Flow::Continue)
    }

    /// Send `session/request_permission` and wait for the client's answer.
    async fn ask_permission(&mut self, session_id: &str) -> BoxResult<Flow> {
        self.outbound_requests += 1;
        let request_id = format!("perm-{}", self.outbound_requests);
        let request = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": "session/request_permission",
            "params": {
                "sessionId": session_id,
                "toolCall": { "toolCallId": "call-1", "title": "write file" },
                "options": [{ "optionId": "allow", "name": "Allow", "kind": "allow_once" }],
            },
        });
        self.write(&request).await?;

        while let Some(line) = self.next_line().await? {
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if msg.get("method").is_none() && msg["id"] == request_id.as_str() {
                let code = msg.pointer("/error/code").and_then(Value::as_i64);
                info!(id = request_id.as_str(), ?code, "client answered request");
                return Ok(Flow::Continue);
            }
            debug!(%msg, "message while waiting for permission");
        }
        warn!("stdin closed while waiting for permission");
        Ok(Flow::Exit)
    }

    async fn reply(&mut self, id: Value, result: Value) -> BoxResult<()> {
        self.write(&json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await
    }

    async fn reply_error(&mut self, id: Value, code: i64, message: &str) -> BoxResult<()> {
        self.write(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }))
        .await
    }

    async fn write(&mut self, message: &Value) -> BoxResult<()> {
        if self.args.mute {
            debug!("muted, dropping outbound message");
            return Ok(());
        }
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.stdout.write_all(line.as_bytes()).await?;
        self.stdout.flush().await?;
        Ok(())
    }
}

/// Identify the prompt encoding and pull out its text.
fn detect_shape(params: &Value) -> Option<(Shape, String)> {
    if let Some(blocks) = params.get("prompt").and_then(Value::as_array) {
        let text = blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        return Some((Shape::ContentBlocks, text));
    }
    if let Some(text) = params.get("prompt").and_then(Value::as_str) {
        return Some((Shape::Text, text.to_owned()));
    }
    if let Some(messages) = params.get("messages").and_then(Value::as_array) {
        let text = messages
            .iter()
            .filter_map(|msg| msg.get("content").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        return Some((Shape::Messages, text));
    }
    params
        .pointer("/message/content")
        .and_then(Value::as_str)
        .map(|text| (Shape::Message, text.to_owned()))
}

async fn serve(args: AgentArgs) -> BoxResult<()> {
    #[cfg(unix)]
    let mut sigterm = if args.ignore_sigterm {
        Some(tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )?)
    } else {
        None
    };

    info!(?args, "mock agent ready");
    let mut agent = MockAgent::new(args);

    while let Some(line) = agent.next_line().await? {
        if agent.handle_line(&line).await? == Flow::Exit {
            return Ok(());
        }
    }
    info!("stdin closed");

    #[cfg(unix)]
    if let Some(sigterm) = sigterm.as_mut() {
        while sigterm.recv().await.is_some() {
            warn!("ignoring SIGTERM");
        }
    }

    Ok(())
}

fn main() -> BoxResult<()> {
    let Cli {
        command: Command::Acp(args),
    } = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(serve(args))
}

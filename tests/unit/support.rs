//! In-memory agent peers for transport, collector and client tests.
//!
//! The harness side gets a [`Transport`] over two [`tokio::io::duplex`]
//! pipes; the test drives the other ends as the "agent".

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;

use acp_harness::acp::collector::CollectLimits;
use acp_harness::acp::transport::Transport;

pub type TestTransport = Transport<DuplexStream, DuplexStream>;

const PIPE_BYTES: usize = 64 * 1024;

/// Agent side of an in-memory transport.
pub struct Peer {
    input: Lines<BufReader<DuplexStream>>,
    output: DuplexStream,
}

/// A harness transport and the agent peer wired to it.
pub fn pair() -> (TestTransport, Peer) {
    let (harness_out, agent_in) = tokio::io::duplex(PIPE_BYTES);
    let (agent_out, harness_in) = tokio::io::duplex(PIPE_BYTES);
    (
        Transport::new(harness_out, harness_in),
        Peer {
            input: BufReader::new(agent_in).lines(),
            output: agent_out,
        },
    )
}

/// Collection bounds suited to in-memory tests.
pub fn limits(max_messages: usize) -> CollectLimits {
    CollectLimits {
        max_messages,
        read_timeout: Duration::from_millis(300),
        reject_agent_requests: true,
    }
}

impl Peer {
    /// Write raw text exactly as given.
    pub async fn send_raw(&mut self, text: &str) {
        self.output
            .write_all(text.as_bytes())
            .await
            .expect("peer write");
        self.output.flush().await.expect("peer flush");
    }

    /// Write one JSON value as a line.
    pub async fn send(&mut self, value: &Value) {
        let line = format!("{value}\n");
        self.send_raw(&line).await;
    }

    /// Next line written by the harness, parsed as JSON.
    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.input.next_line())
            .await
            .expect("harness wrote within 2s")
            .expect("peer read")
            .expect("harness stdin still open");
        serde_json::from_str(&line).expect("harness wrote valid JSON")
    }

    /// Next raw line written by the harness, or `None` on EOF.
    pub async fn recv_line(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(2), self.input.next_line())
            .await
            .expect("harness wrote within 2s")
            .expect("peer read")
    }

    /// Stop reading what the harness writes; its next write fails with a
    /// broken pipe. The returned half is the agent's stdout.
    pub fn hang_up_stdin(self) -> DuplexStream {
        drop(self.input);
        self.output
    }

    /// Close the agent's stdout; the harness sees EOF.
    pub async fn close(&mut self) {
        self.output.shutdown().await.expect("peer shutdown");
    }

    /// Run a scripted agent: every request line is passed to `script`, and
    /// the returned values are written back in order. Ends on EOF.
    pub fn script<F>(mut self, mut script: F) -> JoinHandle<Vec<Value>>
    where
        F: FnMut(&Value) -> Vec<Value> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(Some(line)) = self.input.next_line().await {
                let request: Value = serde_json::from_str(&line).expect("valid JSON from harness");
                for reply in script(&request) {
                    self.send(&reply).await;
                }
                seen.push(request);
            }
            seen
        })
    }
}

/// `{"jsonrpc":"2.0","id":<id>,"result":<result>}` for `request`.
pub fn result_for(request: &Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": request["id"], "result": result })
}

/// `{"jsonrpc":"2.0","id":<id>,"error":{code,message}}` for `request`.
pub fn error_for(request: &Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "error": { "code": code, "message": message },
    })
}

/// A `session/update` notification.
pub fn update(session_id: &str, text: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {
            "sessionId": session_id,
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": text },
            },
        },
    })
}

/// Replies of a well-behaved agent: `initialize`, `session/new` with
/// `sess-1`, and `session/prompt` with two updates and `end_turn`.
pub fn well_behaved(request: &Value) -> Vec<Value> {
    match request["method"].as_str() {
        Some("initialize") => vec![result_for(
            request,
            serde_json::json!({ "protocolVersion": 1, "agentCapabilities": {} }),
        )],
        Some("session/new") => vec![result_for(
            request,
            serde_json::json!({ "sessionId": "sess-1" }),
        )],
        Some("session/prompt") => vec![
            update("sess-1", "one"),
            update("sess-1", "two"),
            result_for(request, serde_json::json!({ "stopReason": "end_turn" })),
        ],
        _ => vec![error_for(request, -32601, "method not found")],
    }
}

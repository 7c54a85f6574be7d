//! Line-delimited JSON-RPC transport over an agent's stdio.
//!
//! Outbound: each [`JsonRpcMessage`] is serialised to one compact JSON line,
//! terminated by `\n`, written and flushed immediately so the agent sees the
//! request without buffering delay.
//!
//! Inbound: stdout is framed by [`LineCodec`] through a [`FramedRead`]. The
//! frame buffer survives a cancelled read, so a read that times out
//! mid-line does not lose the bytes already received.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::acp::codec::LineCodec;
use crate::acp::message::JsonRpcMessage;
use crate::acp::process::{drain, Drained};
use crate::{AppError, Result};

/// Outcome of one bounded read.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// A line that parsed as JSON.
    Message(JsonRpcMessage),
    /// An empty or whitespace-only line.
    Blank,
    /// The agent closed stdout (EOF).
    Closed,
    /// No complete line arrived within the timeout.
    TimedOut,
    /// The cancellation token fired.
    Cancelled,
}

/// Bidirectional JSON-RPC line transport.
///
/// `W` is the agent's stdin, `R` its stdout. Both are generic so tests can
/// substitute an in-memory [`tokio::io::duplex`] pair.
#[derive(Debug)]
pub struct Transport<W, R> {
    writer: Option<W>,
    reader: FramedRead<R, LineCodec>,
    closed: bool,
}

impl<W, R> Transport<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    /// Wrap a writer (agent stdin) and reader (agent stdout).
    #[must_use]
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            writer: Some(writer),
            reader: FramedRead::new(reader, LineCodec::new()),
            closed: false,
        }
    }

    /// Send exactly one message as a single `\n`-terminated line and flush.
    ///
    /// # Errors
    ///
    /// - [`AppError::Transport`]`("stdin already closed")` after
    ///   [`close_writer`](Self::close_writer).
    /// - [`AppError::Transport`]`("write failed: …")` if the pipe is broken.
    pub async fn send(&mut self, message: &JsonRpcMessage) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| AppError::Transport("stdin already closed".into()))?;

        let mut bytes = message.to_line()?.into_bytes();
        bytes.push(b'\n');

        writer
            .write_all(&bytes)
            .await
            .map_err(|e| AppError::Transport(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| AppError::Transport(format!("flush failed: {e}")))?;

        debug!(
            kind = message.kind(),
            method = message.method().unwrap_or(""),
            id = ?message.id(),
            "transport: sent"
        );
        Ok(())
    }

    /// Read exactly one line and parse it.
    ///
    /// Returns `Ok(None)` when the line is empty or the stream is closed.
    /// This call waits as long as the agent does; prefer
    /// [`receive_within`](Self::receive_within) when the peer is untrusted.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the line is not valid JSON or
    /// exceeds the codec limit.
    pub async fn receive(&mut self) -> Result<Option<JsonRpcMessage>> {
        match self.next_line().await? {
            Some(line) if !line.trim().is_empty() => parse(&line).map(Some),
            _ => Ok(None),
        }
    }

    /// Read one line, giving up after `timeout` or when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Same as [`receive`](Self::receive). Timeouts and cancellation are
    /// reported as [`Received`] values, not errors.
    pub async fn receive_within(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Received> {
        tokio::select! {
            biased;

            () = cancel.cancelled() => Ok(Received::Cancelled),

            read = tokio::time::timeout(timeout, self.next_line()) => match read {
                Err(_elapsed) => Ok(Received::TimedOut),
                Ok(Ok(None)) => Ok(Received::Closed),
                Ok(Ok(Some(line))) if line.trim().is_empty() => Ok(Received::Blank),
                Ok(Ok(Some(line))) => parse(&line).map(Received::Message),
                Ok(Err(err)) => Err(err),
            },
        }
    }

    /// Close the agent's stdin. Further [`send`](Self::send) calls fail.
    pub async fn close_writer(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.shutdown().await {
                debug!(%err, "transport: stdin shutdown failed (agent likely gone)");
            }
        }
    }

    /// Consume the transport and return whatever stdout text is left,
    /// including bytes buffered by the frame decoder.
    pub async fn drain_stdout(self, timeout: Duration) -> Drained {
        let buffered = String::from_utf8_lossy(self.reader.read_buffer()).into_owned();
        let rest = drain(self.reader.into_inner(), timeout).await;
        Drained {
            text: buffered + &rest.text,
            complete: rest.complete,
            dropped_bytes: 0,
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        if self.closed {
            return Ok(None);
        }
        match self.reader.next().await {
            None => {
                debug!("transport: stdout closed");
                self.closed = true;
                Ok(None)
            }
            Some(Err(err)) => Err(err),
            Some(Ok(line)) => {
                trace!(raw = line.as_str(), "transport: line");
                Ok(Some(line))
            }
        }
    }
}

fn parse(line: &str) -> Result<JsonRpcMessage> {
    let message = JsonRpcMessage::parse_line(line)?;
    debug!(
        kind = message.kind(),
        method = message.method().unwrap_or(""),
        id = ?message.id(),
        "transport: received"
    );
    Ok(message)
}

//! Newline framing for agent stdout.
//!
//! [`LineCodec`] is the decoder behind the harness's `FramedRead`. A few
//! properties of that read path matter for diagnosis:
//!
//! - A read that times out mid-line loses nothing. The partial bytes stay
//!   in the frame buffer and either complete on the next read or show up in
//!   the teardown's "remaining stdout".
//! - A line over the limit fails once with `line too long`; the rest of
//!   that line is skipped and reading resumes at the next `\n`.
//! - A final line without `\n` is still yielded at EOF, where it usually
//!   fails JSON parsing and surfaces as a truncated message.
//!
//! Outbound messages are not framed here; [`Transport::send`] writes them
//! directly.
//!
//! [`Transport::send`]: crate::acp::transport::Transport::send

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default line limit: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line decoder for agent stdout with a bounded line length.
#[derive(Debug)]
pub struct LineCodec {
    lines: LinesCodec,
    max_length: usize,
}

impl LineCodec {
    /// Decoder limited to [`MAX_LINE_BYTES`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Decoder limited to `max_length` bytes per line, excluding the `\n`.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    /// The configured line limit.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn framing_error(&self, err: LinesCodecError) -> AppError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => AppError::Transport(format!(
                "line too long: exceeded {} bytes",
                self.max_length
            )),
            LinesCodecError::Io(err) => AppError::Io(format!("agent stdout: {err}")),
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        self.lines.decode(src).map_err(|err| self.framing_error(err))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        self.lines.decode_eof(src).map_err(|err| self.framing_error(err))
    }
}

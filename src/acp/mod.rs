//! Agent Client Protocol (ACP) over an agent's stdio.
//!
//! Layers, bottom-up:
//! - [`codec`]: newline framing with a per-line cap.
//! - [`message`]: JSON-RPC 2.0 message model and classification.
//! - [`transport`]: one message per line, bounded reads.
//! - [`process`]: agent spawn, termination and stream draining.
//! - [`collector`]: bounded collection of interleaved responses.
//! - [`prompt`]: prompt payload shapes and stop reasons.
//! - [`client`]: `initialize`, `session/new` and `session/prompt`.

pub mod client;
pub mod codec;
pub mod collector;
pub mod message;
pub mod process;
pub mod prompt;
pub mod transport;

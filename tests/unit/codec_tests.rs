//! Unit tests for the stdout line codec.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use acp_harness::acp::codec::{LineCodec, MAX_LINE_BYTES};
use acp_harness::AppError;

// ── Framing ──────────────────────────────────────────────────────────────────

/// A complete line is returned without its trailing newline.
#[test]
fn complete_line_is_decoded_without_newline() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"id\":1,\"result\":{}}\n");

    let line = codec.decode(&mut buf).expect("decode must succeed");

    assert_eq!(line.as_deref(), Some("{\"id\":1,\"result\":{}}"));
    assert!(buf.is_empty(), "the whole line must be consumed");
}

/// A fragment without a newline is held back until the newline arrives.
#[test]
fn partial_line_is_buffered_until_newline() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"method\":\"session/");

    assert_eq!(codec.decode(&mut buf).expect("decode"), None);

    buf.extend_from_slice(b"update\"}\n");
    assert_eq!(
        codec.decode(&mut buf).expect("decode").as_deref(),
        Some("{\"method\":\"session/update\"}")
    );
}

/// Two lines delivered in one chunk come out as two items.
#[test]
fn batched_lines_are_decoded_one_at_a_time() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\n{\"b\":2}\n");

    assert_eq!(codec.decode(&mut buf).expect("first").as_deref(), Some("{\"a\":1}"));
    assert_eq!(codec.decode(&mut buf).expect("second").as_deref(), Some("{\"b\":2}"));
    assert_eq!(codec.decode(&mut buf).expect("third"), None);
}

/// A trailing carriage return is stripped.
#[test]
fn crlf_terminator_is_stripped() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{}\r\n");

    assert_eq!(codec.decode(&mut buf).expect("decode").as_deref(), Some("{}"));
}

/// An unterminated tail is still yielded at EOF.
#[test]
fn unterminated_tail_is_yielded_at_eof() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"id\":1,\"res");

    let tail = codec.decode_eof(&mut buf).expect("decode_eof");

    assert_eq!(tail.as_deref(), Some("{\"id\":1,\"res"));
}

// ── Limits ───────────────────────────────────────────────────────────────────

/// A line longer than the cap is a transport error.
#[test]
fn oversized_line_is_a_transport_error() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_BYTES + 1].as_slice());

    let err = codec
        .decode(&mut buf)
        .expect_err("oversized line must be rejected");

    match err {
        AppError::Transport(msg) => assert!(msg.contains("line too long"), "got: {msg}"),
        other => panic!("expected AppError::Transport, got {other:?}"),
    }
}

/// After an over-long line the decoder skips to the next newline and
/// carries on.
#[test]
fn decoding_resumes_after_an_oversized_line() {
    let mut codec = LineCodec::with_max_length(8);
    let mut buf = BytesMut::from("xxxxxxxxxxxxxxxx\n{\"a\":1}\n");

    match codec.decode(&mut buf).expect_err("over the limit") {
        AppError::Transport(msg) => assert!(msg.contains("exceeded 8 bytes"), "got: {msg}"),
        other => panic!("expected AppError::Transport, got {other:?}"),
    }
    assert_eq!(codec.decode(&mut buf).expect("next line").as_deref(), Some("{\"a\":1}"));
}

#[test]
fn default_limit_is_one_mebibyte() {
    assert_eq!(LineCodec::default().max_length(), MAX_LINE_BYTES);
    assert_eq!(MAX_LINE_BYTES, 1024 * 1024);
}

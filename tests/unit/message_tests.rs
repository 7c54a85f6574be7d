//! Unit tests for JSON-RPC message classification and serialisation.

use serde_json::{json, Value};

use acp_harness::acp::message::{JsonRpcMessage, RequestId, ResponseOutcome, METHOD_NOT_FOUND};
use acp_harness::AppError;

fn classify(value: Value) -> JsonRpcMessage {
    JsonRpcMessage::from_value(value)
}

// ── Classification ───────────────────────────────────────────────────────────

#[test]
fn method_with_id_is_a_request() {
    let msg = classify(json!({"jsonrpc": "2.0", "id": 4, "method": "fs/read_text_file", "params": {}}));

    let JsonRpcMessage::Request(req) = msg else {
        panic!("expected a request");
    };
    assert_eq!(req.id, RequestId::Number(4));
    assert_eq!(req.method, "fs/read_text_file");
}

#[test]
fn method_without_id_is_a_notification() {
    let msg = classify(json!({"jsonrpc": "2.0", "method": "session/update", "params": {"sessionId": "s"}}));

    assert_eq!(msg.kind(), "notification");
    assert_eq!(msg.method(), Some("session/update"));
    assert_eq!(msg.id(), None);
}

#[test]
fn id_with_result_is_a_response() {
    let msg = classify(json!({"jsonrpc": "2.0", "id": "abc", "result": {"stopReason": "end_turn"}}));

    let JsonRpcMessage::Response(resp) = msg else {
        panic!("expected a response");
    };
    assert!(resp.answers(&RequestId::from("abc")));
    assert_eq!(resp.result(), Some(&json!({"stopReason": "end_turn"})));
    assert!(resp.error().is_none());
}

#[test]
fn id_with_error_is_a_response() {
    let msg = classify(json!({"id": 2, "error": {"code": -32602, "message": "bad params"}}));

    let JsonRpcMessage::Response(resp) = msg else {
        panic!("expected a response");
    };
    let err = resp.error().expect("error member");
    assert_eq!(err.code, -32602);
    assert_eq!(err.message, "bad params");
    assert!(resp.result().is_none());
}

/// A response with both `result` and `error` violates JSON-RPC and is kept
/// as unclassified.
#[test]
fn result_and_error_together_is_unclassified() {
    let msg = classify(json!({"id": 1, "result": {}, "error": {"code": 1, "message": "x"}}));
    assert_eq!(msg.kind(), "unclassified");
}

#[test]
fn result_without_id_member_is_unclassified() {
    let msg = classify(json!({"result": {}}));
    assert_eq!(msg.kind(), "unclassified");
}

#[test]
fn non_object_json_is_unclassified() {
    assert_eq!(classify(json!([1, 2, 3])).kind(), "unclassified");
    assert_eq!(classify(json!("hello")).kind(), "unclassified");
}

/// An `error` member that is not a full error object still makes a response;
/// the raw member is kept in `data`.
#[test]
fn non_conforming_error_member_is_still_a_response() {
    let JsonRpcMessage::Response(resp) = classify(json!({"id": 1, "error": "boom"})) else {
        panic!("expected a response");
    };
    let err = resp.error().expect("error outcome");
    assert_eq!(err.code, 0);
    assert_eq!(err.message, "malformed error member");
    assert_eq!(err.data, Some(json!("boom")));

    let JsonRpcMessage::Response(resp) = classify(json!({"id": 2, "error": {"code": -32603}})) else {
        panic!("expected a response");
    };
    let err = resp.error().expect("error outcome");
    assert_eq!(err.code, -32603);
    assert_eq!(err.data, Some(json!({"code": -32603})));
}

// ── Id equality ──────────────────────────────────────────────────────────────

/// Numeric `1` and string `"1"` are different ids.
#[test]
fn numeric_and_string_ids_never_match() {
    let msg = classify(json!({"id": "1", "result": {}}));
    let JsonRpcMessage::Response(resp) = msg else {
        panic!("expected a response");
    };

    assert!(!resp.answers(&RequestId::Number(1)));
    assert!(resp.answers(&RequestId::from("1")));
}

// ── Parsing and serialisation ────────────────────────────────────────────────

#[test]
fn invalid_json_line_is_a_transport_error() {
    let err = JsonRpcMessage::parse_line("not json at all").expect_err("must fail");
    assert!(matches!(err, AppError::Transport(_)), "got {err:?}");
}

#[test]
fn outbound_request_carries_jsonrpc_version_and_fits_one_line() {
    let msg = JsonRpcMessage::request(
        RequestId::Number(3),
        "session/prompt",
        json!({"sessionId": "s", "prompt": [{"type": "text", "text": "line one\nline two"}]}),
    );

    let line = msg.to_line().expect("serialise");

    assert!(!line.contains('\n'), "payload newlines must be escaped: {line}");
    let wire: Value = serde_json::from_str(&line).expect("valid JSON");
    assert_eq!(wire["jsonrpc"], "2.0");
    assert_eq!(wire["id"], 3);
    assert_eq!(wire["method"], "session/prompt");
}

/// Parsing a serialised request yields the same id, method and params.
#[test]
fn request_survives_serialise_then_parse() {
    let params = json!({"cwd": "/tmp", "mcpServers": []});
    let sent = JsonRpcMessage::request(RequestId::Number(9), "session/new", params.clone());

    let parsed = JsonRpcMessage::parse_line(&sent.to_line().expect("serialise")).expect("parse");

    let JsonRpcMessage::Request(req) = parsed else {
        panic!("expected a request");
    };
    assert_eq!(req.id, RequestId::Number(9));
    assert_eq!(req.method, "session/new");
    assert_eq!(req.params, Some(params));
}

#[test]
fn error_response_serialises_code_and_message() {
    let msg = JsonRpcMessage::error_response(RequestId::from("perm-1"), METHOD_NOT_FOUND, "nope");

    let wire = msg.to_value();

    assert_eq!(wire["id"], "perm-1");
    assert_eq!(wire["error"]["code"], -32601);
    assert_eq!(wire["error"]["message"], "nope");
    assert!(wire.get("result").is_none());
    let JsonRpcMessage::Response(resp) = msg else {
        panic!("expected a response");
    };
    assert!(matches!(resp.outcome, ResponseOutcome::Error(_)));
}

#[test]
fn unclassified_value_serialises_verbatim() {
    let raw = json!({"weird": true});
    assert_eq!(classify(raw.clone()).to_value(), raw);
}

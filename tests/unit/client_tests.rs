//! Unit tests for the ACP protocol client against scripted in-memory agents.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use acp_harness::acp::client::{
    ClientCapabilities, ClientInfo, ClientOptions, FsCapabilities, InitializeParams, ProtocolClient,
    Session,
};
use acp_harness::acp::collector::StopCondition;
use acp_harness::acp::message::RequestId;
use acp_harness::acp::prompt::{PromptShape, StopReason};
use acp_harness::AppError;

use super::support::{error_for, limits, pair, result_for, update, well_behaved};

fn options() -> ClientOptions {
    ClientOptions {
        limits: limits(5),
        settle: Duration::ZERO,
    }
}

fn init_params() -> InitializeParams {
    InitializeParams {
        protocol_version: 1,
        client_capabilities: ClientCapabilities {
            fs: FsCapabilities {
                read_text_file: true,
                write_text_file: false,
            },
            terminal: false,
        },
        client_info: ClientInfo {
            name: "acp-harness".into(),
            version: "0.1.0".into(),
        },
    }
}

fn session() -> Session {
    Session {
        session_id: "sess-1".into(),
    }
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// Every request of a run gets a distinct, increasing id starting at 1.
#[tokio::test]
async fn ids_are_unique_and_increasing_across_a_run() {
    let (mut transport, peer) = pair();
    let agent = peer.script(well_behaved);

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    client.initialize(&init_params()).await.expect("initialize");
    let session = client
        .create_session(Path::new("/work"), &[])
        .await
        .expect("session/new");
    client.prompt(&session, "first").await.expect("prompt 1");
    client.prompt(&session, "second").await.expect("prompt 2");
    let issued = client.issued_ids().to_vec();
    drop(client);

    transport.close_writer().await;
    let seen = agent.await.expect("agent task");

    let wire_ids = seen.iter().map(|req| req["id"].as_i64().expect("numeric id")).collect::<Vec<_>>();
    assert_eq!(wire_ids, vec![1, 2, 3, 4]);
    assert_eq!(issued, (1..=4).map(RequestId::Number).collect::<Vec<_>>());
}

#[tokio::test]
async fn initialize_sends_protocol_version_capabilities_and_client_info() {
    let (mut transport, peer) = pair();
    let agent = peer.script(well_behaved);

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let outcome = client.initialize(&init_params()).await.expect("initialize");
    drop(client);
    transport.close_writer().await;
    let seen = agent.await.expect("agent task");

    assert_eq!(outcome.request_id, RequestId::Number(1));
    assert_eq!(outcome.protocol_version, Some(1));
    let params = &seen[0]["params"];
    assert_eq!(seen[0]["method"], "initialize");
    assert_eq!(params["protocolVersion"], 1);
    assert_eq!(params["clientCapabilities"]["fs"]["readTextFile"], true);
    assert_eq!(params["clientCapabilities"]["fs"]["writeTextFile"], false);
    assert_eq!(params["clientCapabilities"]["terminal"], false);
    assert_eq!(params["clientInfo"]["name"], "acp-harness");
}

#[tokio::test]
async fn initialize_error_response_is_a_protocol_error() {
    let (mut transport, peer) = pair();
    let _agent = peer.script(|req| vec![error_for(req, -32000, "unsupported version")]);

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let err = client
        .initialize(&init_params())
        .await
        .expect_err("error response must fail the handshake");

    match err {
        AppError::Protocol(msg) => assert!(msg.contains("unsupported version"), "got: {msg}"),
        other => panic!("expected AppError::Protocol, got {other:?}"),
    }
}

/// An error member missing `message` still fails the handshake with the
/// agent's code rather than a timeout.
#[tokio::test]
async fn initialize_non_conforming_error_is_a_protocol_error() {
    let (mut transport, peer) = pair();
    let _agent = peer.script(|req| {
        vec![json!({"jsonrpc": "2.0", "id": req["id"].clone(), "error": {"code": -32603}})]
    });

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let err = client.initialize(&init_params()).await.expect_err("must fail");

    match err {
        AppError::Protocol(msg) => assert!(msg.contains("-32603"), "got: {msg}"),
        other => panic!("expected AppError::Protocol, got {other:?}"),
    }
}

/// A silent agent yields a timeout, not a hang.
#[tokio::test]
async fn initialize_without_response_is_a_timeout() {
    let (mut transport, peer) = pair();
    let _agent = peer.script(|_| Vec::new());

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let err = client.initialize(&init_params()).await.expect_err("must time out");

    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");
}

// ── Session ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_session_sends_cwd_and_mcp_servers() {
    let (mut transport, peer) = pair();
    let agent = peer.script(well_behaved);
    let servers = vec![json!({"name": "fs", "command": "mcp-fs", "args": [], "env": []})];

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let session = client
        .create_session(Path::new("/work/project"), &servers)
        .await
        .expect("session/new");
    drop(client);
    transport.close_writer().await;
    let seen = agent.await.expect("agent task");

    assert_eq!(session.session_id, "sess-1");
    assert_eq!(seen[0]["method"], "session/new");
    assert_eq!(seen[0]["params"]["cwd"], "/work/project");
    assert_eq!(seen[0]["params"]["mcpServers"][0]["name"], "fs");
}

#[tokio::test]
async fn missing_session_id_is_a_protocol_error() {
    let (mut transport, peer) = pair();
    let _agent = peer.script(|req| vec![result_for(req, json!({}))]);

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let err = client
        .create_session(Path::new("/"), &[])
        .await
        .expect_err("a session needs an id");

    match err {
        AppError::Protocol(msg) => assert!(msg.contains("sessionId"), "got: {msg}"),
        other => panic!("expected AppError::Protocol, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_or_non_string_session_id_is_a_protocol_error() {
    for bad in [json!(""), json!(42), Value::Null] {
        let (mut transport, peer) = pair();
        let reply = bad.clone();
        let _agent = peer.script(move |req| vec![result_for(req, json!({ "sessionId": reply }))]);

        let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
        let err = client.create_session(Path::new("/"), &[]).await.expect_err("rejected");

        assert!(matches!(err, AppError::Protocol(_)), "sessionId {bad} gave {err:?}");
    }
}

// ── Prompt ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_uses_content_blocks_and_reports_stop_reason() {
    let (mut transport, peer) = pair();
    let agent = peer.script(well_behaved);

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let exchange = client.prompt(&session(), "hi what can you do").await.expect("prompt");
    drop(client);
    transport.close_writer().await;
    let seen = agent.await.expect("agent task");

    let outcome = &exchange.outcomes[0];
    assert!(outcome.resolved);
    assert!(outcome.is_accepted());
    assert_eq!(outcome.shape, PromptShape::ContentBlocks);
    assert_eq!(outcome.stop_reason, Some(StopReason::EndTurn));
    assert_eq!(exchange.collection.notifications().count(), 2);
    assert_eq!(
        seen[0]["params"],
        json!({"sessionId": "sess-1", "prompt": [{"type": "text", "text": "hi what can you do"}]})
    );
}

/// A rejected prompt is an outcome, not an error.
#[tokio::test]
async fn prompt_error_response_is_reported_not_raised() {
    let (mut transport, peer) = pair();
    let _agent = peer.script(|req| vec![error_for(req, -32602, "invalid params")]);

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let exchange = client
        .prompt_with(&session(), "hi", PromptShape::Text)
        .await
        .expect("prompt");

    let outcome = &exchange.outcomes[0];
    assert!(outcome.resolved);
    assert!(!outcome.is_accepted());
    assert_eq!(outcome.error.as_ref().map(|e| e.code), Some(-32602));
    assert_eq!(outcome.stop_reason, None);
}

#[tokio::test]
async fn unknown_stop_reason_is_kept_as_unrecognized() {
    let (mut transport, peer) = pair();
    let _agent = peer.script(|req| vec![result_for(req, json!({"stopReason": "paused"}))]);

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let exchange = client.prompt(&session(), "hi").await.expect("prompt");

    assert_eq!(
        exchange.outcomes[0].stop_reason,
        Some(StopReason::Unrecognized("paused".into()))
    );
}

/// An agent that only streams updates leaves the prompt unresolved.
#[tokio::test]
async fn updates_without_response_leave_the_prompt_unresolved() {
    let (mut transport, peer) = pair();
    let _agent = peer.script(|_| (0..8).map(|n| update("sess-1", &n.to_string())).collect());

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let exchange = client.prompt(&session(), "hi").await.expect("prompt");

    assert!(!exchange.outcomes[0].resolved);
    assert_eq!(exchange.collection.stop, StopCondition::BudgetExhausted);
    assert_eq!(exchange.collection.lines_read, 5);
}

// ── Shape probe ──────────────────────────────────────────────────────────────

fn accepts_messages_only(req: &Value) -> Vec<Value> {
    if req["params"].get("messages").is_some() {
        vec![result_for(req, json!({"stopReason": "end_turn"}))]
    } else {
        vec![error_for(req, -32602, "unsupported prompt shape")]
    }
}

#[tokio::test]
async fn probe_stops_at_the_first_accepted_shape() {
    let (mut transport, peer) = pair();
    let agent = peer.script(accepts_messages_only);

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let probe = client.probe_prompt_shapes(&session(), "hi").await.expect("probe");
    drop(client);
    transport.close_writer().await;
    let seen = agent.await.expect("agent task");

    assert_eq!(probe.accepted, Some(PromptShape::Messages));
    assert_eq!(probe.attempts.len(), 2);
    assert_eq!(seen.len(), 2, "no shape after the accepted one is tried");
    assert_eq!(seen[0]["params"]["prompt"][0]["type"], "text");
}

#[tokio::test]
async fn probe_records_every_rejected_shape() {
    let (mut transport, peer) = pair();
    let _agent = peer.script(|req| vec![error_for(req, -32602, "no")]);

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let probe = client.probe_prompt_shapes(&session(), "hi").await.expect("probe");

    assert_eq!(probe.accepted, None);
    let shapes = probe
        .attempts
        .iter()
        .map(|attempt| attempt.outcomes[0].shape)
        .collect::<Vec<_>>();
    assert_eq!(shapes, PromptShape::PROBE_ORDER.to_vec());
}

#[tokio::test]
async fn probe_stops_when_the_agent_closes_stdout() {
    let (mut transport, mut peer) = pair();
    peer.close().await;

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let probe = client.probe_prompt_shapes(&session(), "hi").await.expect("probe");

    assert_eq!(probe.accepted, None);
    assert_eq!(probe.attempts.len(), 1);
    assert_eq!(probe.attempts[0].collection.stop, StopCondition::StreamClosed);
}

// ── Pipelined prompts ────────────────────────────────────────────────────────

/// Prompts fired back-to-back are matched to out-of-order responses by id.
#[tokio::test]
async fn fire_prompts_matches_out_of_order_responses() {
    let (mut transport, mut peer) = pair();
    peer.send(&json!({"jsonrpc": "2.0", "id": 2, "result": {"stopReason": "max_tokens"}})).await;
    peer.send(&update("sess-1", "x")).await;
    peer.send(&json!({"jsonrpc": "2.0", "id": 1, "result": {"stopReason": "end_turn"}})).await;

    let mut client = ProtocolClient::new(&mut transport, options(), CancellationToken::new());
    let exchange = client
        .fire_prompts(&session(), &["a".to_owned(), "b".to_owned()])
        .await
        .expect("fire");

    assert_eq!(exchange.collection.stop, StopCondition::Terminal);
    let reasons = exchange
        .outcomes
        .iter()
        .map(|o| (o.request_id.clone(), o.stop_reason.clone()))
        .collect::<Vec<_>>();
    assert_eq!(
        reasons,
        vec![
            (RequestId::Number(1), Some(StopReason::EndTurn)),
            (RequestId::Number(2), Some(StopReason::MaxTokens)),
        ]
    );
    drop(client);
    assert_eq!(peer.recv().await["id"], 1);
    assert_eq!(peer.recv().await["id"], 2);
}

//! Integration tests for the JSON-RPC transport against stub agent processes.
//!
//! Covers:
//! - a request resolves with the agent's response
//! - an unsolicited notification reaches the handler
//! - concurrent requests resolve by id when answered out of order
//! - closing settles every pending call; close is idempotent
//! - agent exit fails pending calls with "transport closed"
//! - timeouts, error responses, junk lines, and agent-initiated requests
//! - multi-megabyte lines
//! - direct responses written through the transport

#![cfg(unix)]

use std::time::Duration;

use serde_json::{json, Value};

use acp_host::acp::transport::Transport;
use acp_host::AppError;

use super::test_helpers::{sh_agent, RecordingHandler, EXTRACT_ID};

/// Wait until `transport` reports not running, or fail after two seconds.
async fn wait_stopped(transport: &Transport) {
    for _ in 0..200 {
        if !transport.is_running() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("transport still running");
}

// ── Request/response ────────────────────────────────────────────────────────

#[tokio::test]
async fn request_resolves_with_agent_response() {
    let transport = Transport::new();
    transport
        .start(&sh_agent(
            r#"read -r line; echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"1"}}'; cat >/dev/null"#,
        ))
        .await
        .expect("start");

    let response = transport
        .send_request("initialize", None)
        .await
        .expect("response");

    assert!(response.is_response());
    assert_eq!(response.id(), Some(1), "first id issued is 1");
    assert_eq!(response.result().expect("result")["protocolVersion"], "1");

    transport.close().await;
}

// ── Notification before any request ─────────────────────────────────────

#[tokio::test]
async fn unsolicited_notification_reaches_handler() {
    let (handler, mut rx) = RecordingHandler::new();
    let transport = Transport::with_handler(handler);
    transport
        .start(&sh_agent(
            r#"echo '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"s1"}}'; cat >/dev/null"#,
        ))
        .await
        .expect("start");

    let notification = super::test_helpers::recv_within(&mut rx).await;

    assert_eq!(notification.method(), Some("session/update"));
    assert!(notification.is_notification());
    assert_eq!(transport.pending_count(), 0);

    transport.close().await;
}

// ── Correlation ─────────────────────────────────────────────────────────────

/// Three concurrent requests answered in reverse order each get their own
/// response.
#[tokio::test]
async fn concurrent_requests_correlate_by_id() {
    let script = format!(
        r#"
read -r a; read -r b; read -r c
for line in "$c" "$b" "$a"; do
  {EXTRACT_ID}
  printf '{{"jsonrpc":"2.0","id":%s,"result":{{"n":%s}}}}\n' "$id" "$id"
done
cat >/dev/null
"#
    );
    let transport = Transport::new();
    transport.start(&sh_agent(&script)).await.expect("start");

    let (a, b, c) = tokio::join!(
        transport.send_request("first", None),
        transport.send_request("second", None),
        transport.send_request("third", None),
    );

    let mut ids = Vec::new();
    for response in [a, b, c] {
        let response = response.expect("response");
        let id = response.id().expect("id");
        assert_eq!(response.result().expect("result")["n"], json!(id));
        ids.push(id);
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);

    transport.close().await;
}

/// Ids keep increasing across requests and never repeat.
#[tokio::test]
async fn issued_ids_are_monotonic() {
    let transport = Transport::new();
    transport
        .start(&sh_agent("cat >/dev/null"))
        .await
        .expect("start");

    let first = transport.issue_request("a", None).await.expect("issue");
    let second = transport.issue_request("b", None).await.expect("issue");

    assert_eq!(first.id(), 1);
    assert_eq!(second.id(), 2);
    assert_eq!(second.method(), "b");
    assert_eq!(transport.pending_count(), 2);

    drop(first);
    assert_eq!(transport.pending_count(), 1, "dropping a call forgets it");

    transport.close().await;
}

// ── Close semantics ─────────────────────────────────────────────────────────

#[tokio::test]
async fn close_fails_every_pending_call() {
    let transport = Transport::new();
    transport
        .start(&sh_agent("cat >/dev/null"))
        .await
        .expect("start");

    let mut calls = Vec::new();
    for method in ["a", "b", "c"] {
        calls.push(transport.issue_request(method, None).await.expect("issue"));
    }
    assert_eq!(transport.pending_count(), 3);

    transport.close().await;

    assert_eq!(transport.pending_count(), 0);
    for call in calls {
        let outcome = tokio::time::timeout(Duration::from_millis(100), call)
            .await
            .expect("call must already be settled");
        assert!(matches!(outcome, Err(AppError::Io(ref m)) if m == "transport closed"));
    }
    assert!(!transport.is_running());
}

#[tokio::test]
async fn close_is_idempotent_and_safe_before_start() {
    let never_started = Transport::new();
    never_started.close().await;
    never_started.close().await;

    let transport = Transport::new();
    transport
        .start(&sh_agent("cat >/dev/null"))
        .await
        .expect("start");
    assert!(transport.is_running());

    transport.close().await;
    transport.close().await;
    assert!(!transport.is_running());
}

#[tokio::test]
async fn start_while_running_is_state_error() {
    let transport = Transport::new();
    let agent = sh_agent("cat >/dev/null");
    transport.start(&agent).await.expect("start");

    let err = transport.start(&agent).await.expect_err("second start");
    assert!(matches!(err, AppError::State(_)), "got {err:?}");

    transport.close().await;
    transport.start(&agent).await.expect("restart after close");
    transport.close().await;
}

#[tokio::test]
async fn missing_executable_is_startup_error() {
    let transport = Transport::new();
    let err = transport
        .start(&acp_host::acp::spawner::LaunchSpec::new(
            "/definitely/not/an/agent",
            Vec::<String>::new(),
        ))
        .await
        .expect_err("spawn must fail");

    assert!(matches!(err, AppError::Startup(_)));
    assert!(!transport.is_running());
}

#[tokio::test]
async fn requests_after_close_fail_with_io_error() {
    let transport = Transport::new();
    transport
        .start(&sh_agent("cat >/dev/null"))
        .await
        .expect("start");
    transport.close().await;

    let err = transport.send_request("late", None).await.expect_err("closed");
    assert!(matches!(err, AppError::Io(_)));

    let err = transport
        .send_notification("session/cancel", None)
        .await
        .expect_err("closed");
    assert!(matches!(err, AppError::Io(_)));
}

// ── Agent exit ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn agent_exit_fails_pending_call() {
    let transport = Transport::new();
    transport
        .start(&sh_agent("read -r line; exit 0"))
        .await
        .expect("start");

    let err = transport
        .send_request("initialize", None)
        .await
        .expect_err("agent exits without answering");

    assert!(matches!(err, AppError::Io(ref m) if m == "transport closed"), "got {err:?}");
    wait_stopped(&transport).await;
    transport.close().await;
}

// ── Failure paths ───────────────────────────────────────────────────────────

#[tokio::test]
async fn timeout_removes_pending_call() {
    let transport = Transport::new();
    transport
        .start(&sh_agent("cat >/dev/null"))
        .await
        .expect("start");

    let err = transport
        .send_request_with_timeout("slow", None, Duration::from_millis(100))
        .await
        .expect_err("must time out");

    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");
    assert_eq!(transport.pending_count(), 0);
    transport.close().await;
}

#[tokio::test]
async fn error_response_becomes_rpc_error() {
    let transport = Transport::new();
    transport
        .start(&sh_agent(
            r#"read -r line; echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}'; cat >/dev/null"#,
        ))
        .await
        .expect("start");

    let err = transport
        .send_request("ping", None)
        .await
        .expect_err("error response");

    match err {
        AppError::Rpc { code, message } => {
            assert_eq!(code, -32601);
            assert_eq!(message, "Method not found");
        }
        other => panic!("expected Rpc, got {other:?}"),
    }
    transport.close().await;
}

/// Blank lines, garbage, envelopes without method or id, and responses for
/// unknown ids are all skipped without disturbing the stream.
#[tokio::test]
async fn junk_lines_do_not_stop_the_reader() {
    let transport = Transport::new();
    transport
        .start(&sh_agent(
            r#"read -r line
echo ''
echo 'this is not json'
echo '{"jsonrpc":"2.0"}'
echo '{"jsonrpc":"2.0","id":99,"result":{}}'
echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true},"extra":"ignored"}'
cat >/dev/null"#,
        ))
        .await
        .expect("start");

    let response = transport.send_request("host/check", None).await.expect("response");

    assert_eq!(response.result(), Some(&json!({"ok": true})));
    assert!(transport.is_running());
    transport.close().await;
}

/// A multi-megabyte notification ahead of the response neither stalls nor
/// closes the stream.
#[tokio::test]
async fn large_line_before_response_is_delivered() {
    let (handler, mut rx) = RecordingHandler::new();
    let transport = Transport::with_handler(handler);
    transport
        .start(&sh_agent(
            r#"read -r line
printf '{"jsonrpc":"2.0","method":"session/update","params":{"pad":"'
head -c 2097152 /dev/zero | tr '\0' a
printf '"}}\n'
echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'
cat >/dev/null"#,
        ))
        .await
        .expect("start");

    let response = transport.send_request("host/check", None).await.expect("response");

    assert_eq!(response.result(), Some(&json!({"ok": true})));
    let update = super::test_helpers::recv_within(&mut rx).await;
    let pad = update.params().expect("params")["pad"].as_str().expect("pad");
    assert_eq!(pad.len(), 2_097_152);
    assert!(transport.is_running());
    transport.close().await;
}

// ── Agent-initiated requests ────────────────────────────────────────────────

/// The agent's request is answered on stdin with the handler's result; the
/// stub echoes that answer back as a notification so the test can see it.
#[tokio::test]
async fn agent_request_is_answered_by_handler() {
    let (handler, mut rx) = RecordingHandler::new();
    let transport = Transport::with_handler(handler);
    transport
        .start(&sh_agent(
            r#"echo '{"jsonrpc":"2.0","id":7,"method":"host/hello","params":{}}'
read -r line
printf '{"jsonrpc":"2.0","method":"seen","params":%s}\n' "$line"
cat >/dev/null"#,
        ))
        .await
        .expect("start");

    let seen = super::test_helpers::recv_within(&mut rx).await;
    let answer: &Value = seen.params().expect("params");

    assert_eq!(seen.method(), Some("seen"));
    assert_eq!(answer["id"], 7);
    assert_eq!(answer["result"]["echo"], "host/hello");
    transport.close().await;
}

#[tokio::test]
async fn panicking_request_handler_yields_internal_error() {
    let (handler, mut rx) = RecordingHandler::panicking();
    let transport = Transport::with_handler(handler);
    transport
        .start(&sh_agent(
            r#"echo '{"jsonrpc":"2.0","id":3,"method":"host/explode"}'
read -r line
printf '{"jsonrpc":"2.0","method":"seen","params":%s}\n' "$line"
cat >/dev/null"#,
        ))
        .await
        .expect("start");

    let seen = super::test_helpers::recv_within(&mut rx).await;
    let answer = seen.params().expect("params");

    assert_eq!(answer["id"], 3);
    assert_eq!(answer["error"]["code"], -32603);
    assert!(transport.is_running(), "reader survives the panic");
    transport.close().await;
}

/// Without a handler the agent still gets an answer. The stub writes that
/// answer to a file since nothing on the host side would see it.
#[tokio::test]
async fn request_without_handler_is_method_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let answer_file = dir.path().join("answer.json");

    let transport = Transport::new();
    transport
        .start(&sh_agent(&format!(
            r#"echo '{{"jsonrpc":"2.0","id":5,"method":"host/unknown"}}'
read -r line
printf '%s\n' "$line" > '{path}.tmp' && mv '{path}.tmp' '{path}'
cat >/dev/null"#,
            path = answer_file.display()
        )))
        .await
        .expect("start");

    let mut raw = None;
    for _ in 0..200 {
        if let Ok(text) = std::fs::read_to_string(&answer_file) {
            raw = Some(text);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let answer: Value = serde_json::from_str(raw.expect("answer written").trim()).expect("json");

    assert_eq!(answer["id"], 5);
    assert_eq!(answer["error"]["code"], -32601);
    transport.close().await;
}

/// Responses written directly through the transport reach the agent as
/// single lines.
#[tokio::test]
async fn direct_responses_are_written_to_agent() {
    let (handler, mut rx) = RecordingHandler::new();
    let transport = Transport::with_handler(handler);
    transport
        .start(&sh_agent(
            r#"read -r a; read -r b
printf '{"jsonrpc":"2.0","method":"seen","params":[%s,%s]}\n' "$a" "$b"
cat >/dev/null"#,
        ))
        .await
        .expect("start");

    transport
        .send_response(11, json!({"content": "ok"}))
        .await
        .expect("response");
    transport
        .send_error_response(12, -32602, "bad params")
        .await
        .expect("error response");

    let seen = super::test_helpers::recv_within(&mut rx).await;
    let lines = seen.params().expect("params");

    assert_eq!(lines[0]["id"], 11);
    assert_eq!(lines[0]["result"]["content"], "ok");
    assert_eq!(lines[1]["id"], 12);
    assert_eq!(lines[1]["error"]["code"], -32602);
    transport.close().await;
}

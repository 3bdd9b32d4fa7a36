//! End-to-end session manager tests against scripted stub agents.
//!
//! Covers:
//! - initialize → session/new → prompt with streamed updates
//! - startup, config, and handshake failures leave the manager retryable
//! - state guards: no session, overlapping prompts, after shutdown
//! - cancel, ping, reverse `fs/*` calls during a turn, listener isolation

#![cfg(unix)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acp_host::acp::session::{SessionManager, SessionState};
use acp_host::AppError;

use super::test_helpers::{stub_config, EXTRACT_ID};

const INITIALIZE_OK: &str = r#"printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":1,"agentInfo":{"name":"stub-agent"}}}\n' "$id""#;
const SESSION_NEW_OK: &str =
    r#"printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"s1"}}\n' "$id""#;
const HELLO_CHUNK: &str = r#"echo '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"s1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"Hello!"}}}}'"#;

/// Stub agent answering `initialize` and `session/new`, running
/// `on_prompt` for `session/prompt` (with `$id` set), and answering `ping`
/// with an error.
fn agent_script(on_prompt: &str) -> String {
    let mut script = String::from("while IFS= read -r line; do\n");
    script.push_str(EXTRACT_ID);
    script.push_str("\ncase \"$line\" in\n");
    script.push_str("*'\"method\":\"initialize\"'*) ");
    script.push_str(INITIALIZE_OK);
    script.push_str(" ;;\n*'\"method\":\"session/new\"'*) ");
    script.push_str(SESSION_NEW_OK);
    script.push_str(" ;;\n*'\"method\":\"session/prompt\"'*)\n");
    script.push_str(on_prompt);
    script.push_str("\n;;\n*'\"method\":\"ping\"'*) ");
    script.push_str(
        r#"printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id""#,
    );
    script.push_str(" ;;\nesac\ndone\n");
    script
}

fn prompt_reply(stop_reason: &str) -> String {
    format!(
        r#"printf '{{"jsonrpc":"2.0","id":%s,"result":{{"stopReason":"{stop_reason}"}}}}\n' "$id""#
    )
}

fn manager(script: &str, dir: &Path) -> SessionManager {
    SessionManager::new(stub_config(script, dir))
}

/// Listener output collected into a shared vector.
fn collect_texts(manager: &SessionManager) -> Arc<Mutex<Vec<String>>> {
    let texts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&texts);
    manager.add_update_listener(move |update| {
        if let Some(text) = update.message_text() {
            sink.lock().expect("lock").push(text.to_owned());
        }
    });
    texts
}

async fn wait_for_state(manager: &SessionManager, want: SessionState) {
    for _ in 0..200 {
        if manager.state() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("state never became {want:?}, still {:?}", manager.state());
}

// ── Happy path ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_turn_streams_updates_before_stop_reason() {
    let dir = tempfile::tempdir().expect("tempdir");
    let on_prompt = format!("{HELLO_CHUNK}\n{}", prompt_reply("end_turn"));
    let manager = manager(&agent_script(&on_prompt), dir.path());
    let texts = collect_texts(&manager);

    assert_eq!(manager.state(), SessionState::Uninitialized);
    manager.ensure_initialized().await.expect("initialize");
    assert_eq!(manager.state(), SessionState::Initialized);
    assert_eq!(
        manager.agent_info().expect("agent info").agent_name(),
        Some("stub-agent")
    );

    let session_id = manager.new_session(dir.path()).await.expect("session");
    assert_eq!(session_id, "s1");
    assert_eq!(manager.state(), SessionState::SessionActive);
    assert_eq!(manager.session_id().as_deref(), Some("s1"));

    let stop_reason = manager
        .send_prompt(&session_id, "Say hello")
        .await
        .expect("prompt");

    assert_eq!(stop_reason, "end_turn");
    assert_eq!(*texts.lock().expect("lock"), vec!["Hello!".to_owned()]);
    assert_eq!(manager.state(), SessionState::SessionActive);

    manager.shutdown().await;
}

#[tokio::test]
async fn missing_stop_reason_defaults_to_end_turn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let on_prompt = r#"printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id""#;
    let manager = manager(&agent_script(on_prompt), dir.path());

    manager.ensure_initialized().await.expect("initialize");
    let session_id = manager.new_session(dir.path()).await.expect("session");

    let stop_reason = manager.send_prompt(&session_id, "hi").await.expect("prompt");
    assert_eq!(stop_reason, "end_turn");

    manager.shutdown().await;
}

#[tokio::test]
async fn ensure_initialized_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(&agent_script(&prompt_reply("end_turn")), dir.path());

    manager.ensure_initialized().await.expect("first");
    manager.ensure_initialized().await.expect("second");

    assert_eq!(manager.state(), SessionState::Initialized);
    assert!(manager.is_running());
    manager.shutdown().await;
}

// ── Startup and handshake failures ──────────────────────────────────────────

#[tokio::test]
async fn blank_command_is_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = stub_config("true", dir.path());
    config.agent.command = "   ".into();
    let manager = SessionManager::new(config);

    let err = manager.ensure_initialized().await.expect_err("no command");

    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
    assert_eq!(manager.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn missing_executable_is_startup_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = stub_config("true", dir.path());
    config.agent.command = "/definitely/not/an/agent".into();
    config.agent.args.clear();
    let manager = SessionManager::new(config);

    let err = manager.ensure_initialized().await.expect_err("spawn fails");

    assert!(err.is_agent_unavailable(), "got {err:?}");
    assert!(matches!(err, AppError::Startup(_)));
    assert_eq!(manager.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn initialize_error_response_is_handshake_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = format!(
        r#"read -r line; {EXTRACT_ID}
printf '{{"jsonrpc":"2.0","id":%s,"error":{{"code":-32000,"message":"unsupported client"}}}}\n' "$id"
cat >/dev/null"#
    );
    let manager = manager(&script, dir.path());

    let err = manager.ensure_initialized().await.expect_err("rejected");

    assert!(matches!(err, AppError::Handshake(_)), "got {err:?}");
    assert_eq!(manager.state(), SessionState::Uninitialized);
    assert!(!manager.is_running());
}

#[tokio::test]
async fn silent_agent_times_out_handshake_and_can_retry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = stub_config("cat >/dev/null", dir.path());
    config.timeouts.initialize_seconds = 1;
    let manager = SessionManager::new(config);

    let err = manager.ensure_initialized().await.expect_err("timeout");
    assert!(matches!(err, AppError::Handshake(_)), "got {err:?}");
    assert_eq!(manager.state(), SessionState::Uninitialized);

    let err = manager.ensure_initialized().await.expect_err("still silent");
    assert!(matches!(err, AppError::Handshake(_)));
}

// ── State guards ────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_without_session_is_session_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(&agent_script(&prompt_reply("end_turn")), dir.path());

    let err = manager.send_prompt("s1", "hi").await.expect_err("no agent");
    assert!(matches!(err, AppError::Session(_)), "got {err:?}");

    manager.ensure_initialized().await.expect("initialize");
    let err = manager.send_prompt("s1", "hi").await.expect_err("no session");
    assert!(matches!(err, AppError::Session(_)), "got {err:?}");

    manager.new_session(dir.path()).await.expect("session");
    let err = manager
        .send_prompt("other", "hi")
        .await
        .expect_err("foreign id");
    assert!(matches!(err, AppError::Session(_)), "got {err:?}");

    manager.shutdown().await;
}

/// A second prompt during a turn is rejected; shutting down mid-turn fails
/// the first one.
#[tokio::test]
async fn overlapping_prompt_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = Arc::new(manager(&agent_script(":"), dir.path()));
    manager.ensure_initialized().await.expect("initialize");
    let session_id = manager.new_session(dir.path()).await.expect("session");

    let first = tokio::spawn({
        let manager = Arc::clone(&manager);
        let session_id = session_id.clone();
        async move { manager.send_prompt(&session_id, "long").await }
    });
    wait_for_state(&manager, SessionState::PromptInFlight).await;

    let err = manager
        .send_prompt(&session_id, "again")
        .await
        .expect_err("overlap");
    assert!(matches!(err, AppError::Session(_)), "got {err:?}");

    manager.shutdown().await;
    let outcome = first.await.expect("join");
    assert!(matches!(outcome, Err(AppError::Io(_))), "got {outcome:?}");
}

#[tokio::test]
async fn shutdown_is_final_and_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(&agent_script(&prompt_reply("end_turn")), dir.path());
    manager.ensure_initialized().await.expect("initialize");
    let session_id = manager.new_session(dir.path()).await.expect("session");

    manager.shutdown().await;
    manager.shutdown().await;

    assert_eq!(manager.state(), SessionState::Closed);
    assert!(manager.session_id().is_none());
    assert!(!manager.is_running());

    let err = manager.ensure_initialized().await.expect_err("closed");
    assert!(matches!(err, AppError::State(_)), "got {err:?}");
    let err = manager
        .send_prompt(&session_id, "hi")
        .await
        .expect_err("closed");
    assert!(matches!(err, AppError::Session(_)), "got {err:?}");
    let err = manager.new_session(dir.path()).await.expect_err("closed");
    assert!(matches!(err, AppError::State(_)), "got {err:?}");
}

// ── Cancel and ping ─────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_reaches_agent_during_turn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let on_prompt = r#"pid=$id
while IFS= read -r line; do
  case "$line" in *'"method":"session/cancel"'*) break ;; esac
done
printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"cancelled"}}\n' "$pid""#;
    let manager = Arc::new(manager(&agent_script(on_prompt), dir.path()));
    manager.ensure_initialized().await.expect("initialize");
    let session_id = manager.new_session(dir.path()).await.expect("session");

    let turn = tokio::spawn({
        let manager = Arc::clone(&manager);
        let session_id = session_id.clone();
        async move { manager.send_prompt(&session_id, "work forever").await }
    });
    wait_for_state(&manager, SessionState::PromptInFlight).await;

    manager.cancel_session(&session_id).await.expect("cancel");

    let stop_reason = tokio::time::timeout(Duration::from_secs(5), turn)
        .await
        .expect("turn ends after cancel")
        .expect("join")
        .expect("prompt");
    assert_eq!(stop_reason, "cancelled");
    assert_eq!(manager.state(), SessionState::SessionActive);

    manager.shutdown().await;
}

#[tokio::test]
async fn cancel_without_agent_is_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager("true", dir.path());

    manager.cancel_session("s1").await.expect("no-op");
    assert!(!manager.ping().await);
}

#[tokio::test]
async fn ping_counts_error_response_as_alive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(&agent_script(&prompt_reply("end_turn")), dir.path());
    manager.ensure_initialized().await.expect("initialize");

    assert!(manager.ping().await);

    manager.shutdown().await;
    assert!(!manager.ping().await);
}

// ── Agent-initiated requests during a turn ──────────────────────────────────

/// The agent writes a file through the host and only finishes its turn once
/// the host has answered.
#[tokio::test]
async fn reverse_write_during_prompt_lands_in_working_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let on_prompt = r#"pid=$id
echo '{"jsonrpc":"2.0","id":100,"method":"fs/write_text_file","params":{"sessionId":"s1","path":"notes/out.txt","content":"written by agent"}}'
while IFS= read -r line; do
  case "$line" in *'"id":100'*) break ;; esac
done
printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"end_turn"}}\n' "$pid""#;
    let manager = manager(&agent_script(on_prompt), dir.path());
    manager.ensure_initialized().await.expect("initialize");
    let session_id = manager.new_session(dir.path()).await.expect("session");

    let stop_reason = manager
        .send_prompt(&session_id, "write a file")
        .await
        .expect("prompt");

    assert_eq!(stop_reason, "end_turn");
    let written = std::fs::read_to_string(dir.path().join("notes/out.txt")).expect("file");
    assert_eq!(written, "written by agent");

    manager.shutdown().await;
}

// ── Listeners ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn panicking_listener_does_not_block_others() {
    let dir = tempfile::tempdir().expect("tempdir");
    let on_prompt = format!("{HELLO_CHUNK}\n{}", prompt_reply("end_turn"));
    let manager = manager(&agent_script(&on_prompt), dir.path());
    manager.add_update_listener(|_| panic!("listener exploded"));
    let texts = collect_texts(&manager);

    manager.ensure_initialized().await.expect("initialize");
    let session_id = manager.new_session(dir.path()).await.expect("session");
    manager.send_prompt(&session_id, "hi").await.expect("prompt");

    assert_eq!(*texts.lock().expect("lock"), vec!["Hello!".to_owned()]);
    assert!(manager.is_running());

    manager.shutdown().await;
}

#[tokio::test]
async fn removed_listener_stops_receiving() {
    let dir = tempfile::tempdir().expect("tempdir");
    let on_prompt = format!("{HELLO_CHUNK}\n{}", prompt_reply("end_turn"));
    let manager = manager(&agent_script(&on_prompt), dir.path());

    let count = Arc::new(Mutex::new(0_usize));
    let id = manager.add_update_listener({
        let count = Arc::clone(&count);
        move |_| *count.lock().expect("lock") += 1
    });
    assert!(manager.remove_update_listener(id));
    assert!(!manager.remove_update_listener(id), "second removal is a no-op");

    manager.ensure_initialized().await.expect("initialize");
    let session_id = manager.new_session(dir.path()).await.expect("session");
    manager.send_prompt(&session_id, "hi").await.expect("prompt");

    assert_eq!(*count.lock().expect("lock"), 0);
    manager.shutdown().await;
}

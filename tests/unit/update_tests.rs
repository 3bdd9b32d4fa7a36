//! Unit tests for `session/update` payload parsing.

use serde_json::json;

use acp_host::acp::update::{SessionUpdate, UpdateKind};

#[test]
fn agent_message_chunk_text_is_extracted() {
    let params = json!({
        "sessionId": "s1",
        "update": {
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "Hello!"}
        }
    });

    let update = SessionUpdate::from_params(&params);

    assert_eq!(update.kind, UpdateKind::AgentMessageChunk);
    assert_eq!(update.session_id.as_deref(), Some("s1"));
    assert_eq!(update.message_text(), Some("Hello!"));
    assert!(update.tool_call.is_none());
}

#[test]
fn legacy_type_discriminator_is_accepted() {
    let params = json!({
        "update": {"type": "agent_thought_chunk", "content": {"type": "text", "text": "hmm"}}
    });

    let update = SessionUpdate::from_params(&params);

    assert_eq!(update.kind, UpdateKind::AgentThoughtChunk);
    assert_eq!(update.text.as_deref(), Some("hmm"));
    assert_eq!(update.message_text(), None, "thoughts are not message text");
}

#[test]
fn tool_call_fields_are_extracted() {
    let params = json!({
        "sessionId": "s1",
        "update": {
            "sessionUpdate": "tool_call_update",
            "toolCallId": "call_1",
            "title": "Read file",
            "status": "completed",
            "rawInput": {"path": "/a"},
            "rawOutput": "ok"
        }
    });

    let update = SessionUpdate::from_params(&params);
    let call = update.tool_call.expect("tool call info");

    assert_eq!(update.kind, UpdateKind::ToolCallUpdate);
    assert_eq!(call.id.as_deref(), Some("call_1"));
    assert_eq!(call.title.as_deref(), Some("Read file"));
    assert_eq!(call.status.as_deref(), Some("completed"));
    assert_eq!(call.raw_input, Some(json!({"path": "/a"})));
    assert_eq!(call.raw_output, Some(json!("ok")));
}

#[test]
fn plan_keeps_raw_payload() {
    let params = json!({
        "update": {"sessionUpdate": "plan", "entries": [{"content": "step 1"}]}
    });

    let update = SessionUpdate::from_params(&params);

    assert_eq!(update.kind, UpdateKind::Plan);
    assert!(update.text.is_none());
    assert_eq!(update.raw["entries"][0]["content"], "step 1");
}

#[test]
fn unrecognised_or_missing_update_is_unknown() {
    let odd = SessionUpdate::from_params(&json!({"update": {"sessionUpdate": "teleport"}}));
    assert_eq!(odd.kind, UpdateKind::Unknown);

    let missing = SessionUpdate::from_params(&json!({"sessionId": "s1"}));
    assert_eq!(missing.kind, UpdateKind::Unknown);
    assert_eq!(missing.session_id.as_deref(), Some("s1"));

    let not_object = SessionUpdate::from_params(&json!("garbage"));
    assert_eq!(not_object.kind, UpdateKind::Unknown);
}

#[test]
fn non_text_content_has_no_text() {
    let params = json!({
        "update": {
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "image", "data": "..."}
        }
    });

    assert_eq!(SessionUpdate::from_params(&params).text, None);
}

#[test]
fn kind_names_round_trip() {
    for kind in [
        UpdateKind::AgentMessageChunk,
        UpdateKind::UserMessageChunk,
        UpdateKind::ToolCall,
        UpdateKind::AvailableCommandsUpdate,
        UpdateKind::CurrentModeUpdate,
        UpdateKind::ConfigOptionUpdate,
    ] {
        assert_eq!(UpdateKind::parse(kind.as_str()), kind);
    }
}

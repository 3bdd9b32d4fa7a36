//! `session/update` notification payloads.
//!
//! While a prompt turn is in flight the agent streams progress as
//! `session/update` notifications:
//!
//! ```json
//! {"jsonrpc":"2.0","method":"session/update","params":{
//!   "sessionId":"s1",
//!   "update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"Hello!"}}
//! }}
//! ```
//!
//! [`SessionUpdate::from_params`] never fails: anything it cannot make sense
//! of becomes [`UpdateKind::Unknown`] with the raw JSON preserved.

use serde_json::Value;

/// Method name of the update notification.
pub const SESSION_UPDATE_METHOD: &str = "session/update";

/// Discriminator of a session update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    /// Streamed assistant output.
    AgentMessageChunk,
    /// Streamed assistant reasoning.
    AgentThoughtChunk,
    /// Echo of user input.
    UserMessageChunk,
    /// A tool call was started.
    ToolCall,
    /// Progress or result of an earlier tool call.
    ToolCallUpdate,
    /// Execution plan.
    Plan,
    /// Slash commands available in the session.
    AvailableCommandsUpdate,
    /// Session mode changed.
    CurrentModeUpdate,
    /// Session configuration option changed.
    ConfigOptionUpdate,
    /// Missing or unrecognised discriminator.
    Unknown,
}

impl UpdateKind {
    /// Map a wire discriminator to a kind.
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag {
            "agent_message_chunk" => Self::AgentMessageChunk,
            "agent_thought_chunk" => Self::AgentThoughtChunk,
            "user_message_chunk" => Self::UserMessageChunk,
            "tool_call" => Self::ToolCall,
            "tool_call_update" => Self::ToolCallUpdate,
            "plan" => Self::Plan,
            "available_commands_update" => Self::AvailableCommandsUpdate,
            "current_mode_update" => Self::CurrentModeUpdate,
            "config_option_update" => Self::ConfigOptionUpdate,
            _ => Self::Unknown,
        }
    }

    /// Wire discriminator, `"unknown"` for [`UpdateKind::Unknown`].
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentMessageChunk => "agent_message_chunk",
            Self::AgentThoughtChunk => "agent_thought_chunk",
            Self::UserMessageChunk => "user_message_chunk",
            Self::ToolCall => "tool_call",
            Self::ToolCallUpdate => "tool_call_update",
            Self::Plan => "plan",
            Self::AvailableCommandsUpdate => "available_commands_update",
            Self::CurrentModeUpdate => "current_mode_update",
            Self::ConfigOptionUpdate => "config_option_update",
            Self::Unknown => "unknown",
        }
    }

    /// `true` for the three `*_chunk` kinds.
    #[must_use]
    pub fn is_chunk(self) -> bool {
        matches!(
            self,
            Self::AgentMessageChunk | Self::AgentThoughtChunk | Self::UserMessageChunk
        )
    }

    /// `true` for `tool_call` and `tool_call_update`.
    #[must_use]
    pub fn is_tool_call(self) -> bool {
        matches!(self, Self::ToolCall | Self::ToolCallUpdate)
    }
}

/// Tool-call fields of a `tool_call` / `tool_call_update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallInfo {
    /// Agent-assigned tool call id.
    pub id: Option<String>,
    /// Human-readable title.
    pub title: Option<String>,
    /// `pending`, `in_progress`, `completed`, `failed`, ...
    pub status: Option<String>,
    /// Tool input, as sent.
    pub raw_input: Option<Value>,
    /// Tool output, as sent.
    pub raw_output: Option<Value>,
}

/// One parsed `session/update`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    /// Session the update belongs to.
    pub session_id: Option<String>,
    /// Discriminator.
    pub kind: UpdateKind,
    /// Text of a chunk kind.
    pub text: Option<String>,
    /// Tool-call fields of a tool kind.
    pub tool_call: Option<ToolCallInfo>,
    /// The `update` object as received; `Null` when absent.
    pub raw: Value,
}

impl SessionUpdate {
    /// Parse the `params` of a `session/update` notification.
    #[must_use]
    pub fn from_params(params: &Value) -> Self {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let Some(update) = params.get("update").filter(|u| u.is_object()) else {
            return Self {
                session_id,
                kind: UpdateKind::Unknown,
                text: None,
                tool_call: None,
                raw: Value::Null,
            };
        };

        let kind = update
            .get("sessionUpdate")
            .or_else(|| update.get("type"))
            .and_then(Value::as_str)
            .map_or(UpdateKind::Unknown, UpdateKind::parse);

        let text = if kind.is_chunk() {
            chunk_text(update)
        } else {
            None
        };
        let tool_call = kind.is_tool_call().then(|| tool_call_info(update));

        Self {
            session_id,
            kind,
            text,
            tool_call,
            raw: update.clone(),
        }
    }

    /// Text of an `agent_message_chunk`, `None` for every other kind.
    #[must_use]
    pub fn message_text(&self) -> Option<&str> {
        match self.kind {
            UpdateKind::AgentMessageChunk => self.text.as_deref(),
            _ => None,
        }
    }
}

/// Text of a chunk's content block. Only `text` blocks carry text.
fn chunk_text(update: &Value) -> Option<String> {
    update
        .get("content")
        .filter(|c| c.is_object())
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn tool_call_info(update: &Value) -> ToolCallInfo {
    let string = |key: &str| update.get(key).and_then(Value::as_str).map(str::to_owned);
    ToolCallInfo {
        id: string("toolCallId"),
        title: string("title"),
        status: string("status"),
        raw_input: update.get("rawInput").cloned(),
        raw_output: update.get("rawOutput").cloned(),
    }
}

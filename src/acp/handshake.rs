//! ACP initialization handshake.
//!
//! Before any session exists the host performs two exchanges over a started
//! [`Transport`]:
//!
//! 1. **`initialize`**: the host announces its protocol version, identity,
//!    and client capabilities; the agent answers with its own version,
//!    capabilities, and info.
//! 2. **`session/new`**: the host asks for a session rooted at a working
//!    directory; the agent answers with an opaque `sessionId`.
//!
//! ```json
//! {
//!   "jsonrpc": "2.0", "id": 1, "method": "initialize",
//!   "params": {
//!     "protocolVersion": 1,
//!     "clientInfo": { "name": "acp-host", "version": "0.1.0" },
//!     "clientCapabilities": {
//!       "fs": { "readTextFile": true, "writeTextFile": true },
//!       "terminal": true
//!     }
//!   }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::acp::transport::Transport;
use crate::{AppError, Result};

/// ACP protocol version this host speaks.
pub const PROTOCOL_VERSION: u64 = 1;

/// Name announced in `clientInfo`.
pub const CLIENT_NAME: &str = "acp-host";

/// Default bound on the `initialize` and `session/new` exchanges.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the agent told us about itself in its `initialize` response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Negotiated version. Agents send either a number or a string.
    #[serde(default)]
    pub protocol_version: Option<Value>,
    /// Opaque capability blob.
    #[serde(default)]
    pub agent_capabilities: Value,
    /// Opaque identity blob (`name`, `version`, ...).
    #[serde(default)]
    pub agent_info: Value,
    /// Authentication methods offered by the agent.
    #[serde(default)]
    pub auth_methods: Vec<Value>,
}

impl InitializeResult {
    /// Agent name from `agentInfo`, if it sent one.
    #[must_use]
    pub fn agent_name(&self) -> Option<&str> {
        self.agent_info.get("name").and_then(Value::as_str)
    }
}

/// Params of the `initialize` request.
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION")
        },
        "clientCapabilities": {
            "fs": { "readTextFile": true, "writeTextFile": true },
            "terminal": true
        }
    })
}

/// Params of the `session/new` request.
#[must_use]
pub fn new_session_params(cwd: &Path) -> Value {
    json!({
        "cwd": cwd.to_string_lossy(),
        "mcpServers": []
    })
}

/// Run the `initialize` exchange.
///
/// # Errors
///
/// `AppError::Handshake` on error response, timeout, closed transport, or a
/// result that is not an object.
pub async fn initialize(transport: &Transport, timeout: Duration) -> Result<InitializeResult> {
    let response = transport
        .send_request_with_timeout("initialize", Some(initialize_params()), timeout)
        .await
        .map_err(|e| AppError::Handshake(format!("initialize failed: {e}")))?;

    let result = response
        .into_result()
        .map_err(|e| AppError::Handshake(format!("initialize failed: {e}")))?;
    if !result.is_object() {
        return Err(AppError::Handshake(format!(
            "initialize returned a non-object result: {result}"
        )));
    }

    let parsed: InitializeResult = serde_json::from_value(result)
        .map_err(|e| AppError::Handshake(format!("invalid initialize result: {e}")))?;

    if let Some(version) = &parsed.protocol_version {
        if !version_matches(version) {
            warn!(%version, expected = PROTOCOL_VERSION, "handshake: agent speaks a different protocol version");
        }
    }

    info!(
        agent = parsed.agent_name().unwrap_or("unknown"),
        protocol_version = ?parsed.protocol_version,
        "handshake: initialize complete"
    );
    Ok(parsed)
}

/// Run the `session/new` exchange and return the agent-assigned session id.
///
/// # Errors
///
/// `AppError::Session` on error response, timeout, or a missing `sessionId`.
pub async fn new_session(transport: &Transport, cwd: &Path, timeout: Duration) -> Result<String> {
    let response = transport
        .send_request_with_timeout("session/new", Some(new_session_params(cwd)), timeout)
        .await
        .map_err(|e| AppError::Session(format!("session/new failed: {e}")))?;

    let result = response
        .into_result()
        .map_err(|e| AppError::Session(format!("session/new failed: {e}")))?;

    let session_id = result
        .get("sessionId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Session("session/new result has no sessionId".into()))?;

    debug!(session_id, cwd = %cwd.display(), "handshake: session created");
    Ok(session_id.to_owned())
}

/// Whether `version` (number or numeric string) equals [`PROTOCOL_VERSION`].
fn version_matches(version: &Value) -> bool {
    match version {
        Value::Number(n) => n.as_u64() == Some(PROTOCOL_VERSION),
        Value::String(s) => s.trim().parse::<u64>().ok() == Some(PROTOCOL_VERSION),
        _ => false,
    }
}

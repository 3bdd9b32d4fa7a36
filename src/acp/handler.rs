//! Reverse-RPC handler for agent-initiated requests.
//!
//! The agent calls back into the host while a prompt turn is running to read
//! and write files, ask for permission, and run commands. Each request is
//! dispatched by method:
//!
//! | Method                        | Result                                        |
//! |-------------------------------|-----------------------------------------------|
//! | `fs/read_text_file`           | `{"content"}`                                 |
//! | `fs/write_text_file`          | `{"success": true}`                           |
//! | `session/request_permission`  | `{"granted", "outcome"}`                      |
//! | `terminal/create`             | `{"terminalId"}`                              |
//! | `terminal/output`             | `{"output", "truncated", "exitStatus"?}`      |
//! | `terminal/wait_for_exit`      | `{"exitCode", "output"}` or `timedOut` marker |
//! | `terminal/release`            | `{"success": true}`                           |
//! | `terminal/kill`               | `{"success": true}`                           |
//!
//! Every failure, including unknown methods and malformed params, is
//! answered with a `-32603` error response; nothing escapes [`ReverseRpcHandler::handle`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acp::message::{Message, INTERNAL_ERROR};
use crate::acp::terminal::{ManagedTerminal, TerminalRequest, TerminalTable};
use crate::acp::transport::{InboundHandler, ResponseFuture};
use crate::{AppError, Result};

/// Default bound for `terminal/wait_for_exit` when the agent sends none.
pub const DEFAULT_TERMINAL_WAIT: Duration = Duration::from_millis(30_000);

// ── Request params ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadTextFileParams {
    path: String,
    /// 1-based first line.
    #[serde(default)]
    line: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteTextFileParams {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EnvVariable {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTerminalParams {
    command: String,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Vec<EnvVariable>,
    #[serde(default)]
    output_byte_limit: Option<usize>,
    #[serde(default)]
    terminal_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalIdParams {
    terminal_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitForExitParams {
    terminal_id: String,
    /// Milliseconds.
    #[serde(default)]
    timeout: Option<u64>,
}

// ── Handler ───────────────────────────────────────────────────────────────────

/// Answers `fs/*`, `session/request_permission`, and `terminal/*` requests.
///
/// Relative paths are resolved against the handler's root directory.
/// Dropping the handler force-kills every terminal it still owns.
#[derive(Debug)]
pub struct ReverseRpcHandler {
    root: PathBuf,
    auto_approve: bool,
    terminal_wait: Duration,
    terminals: TerminalTable,
}

impl ReverseRpcHandler {
    /// Handler resolving relative paths against `root`, approving every
    /// permission request.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            auto_approve: true,
            terminal_wait: DEFAULT_TERMINAL_WAIT,
            terminals: TerminalTable::new(),
        }
    }

    /// Set the permission policy.
    #[must_use]
    pub fn auto_approve(mut self, approve: bool) -> Self {
        self.auto_approve = approve;
        self
    }

    /// Set the default `terminal/wait_for_exit` bound.
    #[must_use]
    pub fn terminal_wait(mut self, wait: Duration) -> Self {
        self.terminal_wait = wait;
        self
    }

    /// Terminals currently owned by this handler.
    #[must_use]
    pub fn terminals(&self) -> &TerminalTable {
        &self.terminals
    }

    /// Answer one agent request. Never fails: errors become error responses.
    pub async fn handle(&self, request: &Message) -> Message {
        let id = request.id().unwrap_or_default();
        let method = request.method().unwrap_or_default();
        let params = request.params().unwrap_or(&Value::Null);

        match self.dispatch(method, params).await {
            Ok(result) => {
                debug!(id, method, "reverse rpc: handled");
                Message::response(id, result)
            }
            Err(e) => {
                warn!(id, method, error = %e, "reverse rpc: request failed");
                Message::error_response(id, INTERNAL_ERROR, e.to_string())
            }
        }
    }

    /// Run `method` and return its result payload.
    ///
    /// # Errors
    ///
    /// - `AppError::Unsupported` for methods outside the table above.
    /// - `AppError::Acp` for params that do not match the method.
    /// - `AppError::FsRead`, `AppError::FsWrite`, `AppError::TerminalCreate`
    ///   for operation failures.
    pub async fn dispatch(&self, method: &str, params: &Value) -> Result<Value> {
        match method {
            "fs/read_text_file" => self.read_text_file(parse(method, params)?).await,
            "fs/write_text_file" => self.write_text_file(parse(method, params)?).await,
            "session/request_permission" => Ok(self.request_permission(params)),
            "terminal/create" => self.create_terminal(parse(method, params)?),
            "terminal/output" => Ok(self.terminal_output(&parse(method, params)?)),
            "terminal/wait_for_exit" => Ok(self.wait_for_exit(parse(method, params)?).await),
            "terminal/release" => Ok(self.release_terminal(&parse(method, params)?)),
            "terminal/kill" => Ok(self.kill_terminal(&parse(method, params)?)),
            other => Err(AppError::Unsupported(format!("Unknown method: {other}"))),
        }
    }

    // ── fs ────────────────────────────────────────────────────────────────────

    async fn read_text_file(&self, params: ReadTextFileParams) -> Result<Value> {
        let path = self.resolve(&params.path);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::FsRead(format!("{}: {e}", path.display())))?;

        let content = slice_lines(&content, params.line, params.limit);
        Ok(json!({ "content": content }))
    }

    async fn write_text_file(&self, params: WriteTextFileParams) -> Result<Value> {
        let path = self.resolve(&params.path);
        let written = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &params.content))
            .await
            .map_err(|e| AppError::FsWrite(format!("write task failed: {e}")))??;

        info!(path = %written.display(), "reverse rpc: file written");
        Ok(json!({ "success": true }))
    }

    // ── permission ────────────────────────────────────────────────────────────

    fn request_permission(&self, params: &Value) -> Value {
        let tool = params
            .pointer("/toolCall/title")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        if !self.auto_approve {
            info!(tool, "reverse rpc: permission denied by policy");
            return json!({ "granted": false, "outcome": { "outcome": "cancelled" } });
        }

        info!(tool, "reverse rpc: permission granted");
        let mut outcome = json!({ "outcome": "selected" });
        if let Some(option_id) = pick_allow_option(params) {
            outcome["optionId"] = Value::String(option_id.to_owned());
        }
        json!({ "granted": true, "outcome": outcome })
    }

    // ── terminal ──────────────────────────────────────────────────────────────

    fn create_terminal(&self, params: CreateTerminalParams) -> Result<Value> {
        let id = params
            .terminal_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("term-{}", Uuid::new_v4().simple()));

        let request = TerminalRequest {
            command: params.command,
            args: params.args,
            cwd: params.cwd.as_deref().map(|cwd| self.resolve(cwd)),
            env: params.env.into_iter().map(|v| (v.name, v.value)).collect(),
            output_byte_limit: params.output_byte_limit,
        };

        let terminal = ManagedTerminal::spawn(id.clone(), &request)?;
        self.terminals.insert(terminal);
        Ok(json!({ "terminalId": id }))
    }

    fn terminal_output(&self, params: &TerminalIdParams) -> Value {
        let Some(terminal) = self.terminals.get(&params.terminal_id) else {
            return json!({
                "output": "",
                "error": format!("Unknown terminal: {}", params.terminal_id)
            });
        };

        // Exit is published only after both streams drained, so reading it
        // first guarantees the drain below holds the final output.
        let exited = terminal.exit_state();
        let drained = terminal.take_output();
        let mut result = json!({ "output": drained.output, "truncated": drained.truncated });
        if let Some(state) = exited {
            result["exitStatus"] = json!({ "exitCode": state.code, "signal": state.signal });
        }
        result
    }

    async fn wait_for_exit(&self, params: WaitForExitParams) -> Value {
        let Some(terminal) = self.terminals.get(&params.terminal_id) else {
            return json!({
                "exitCode": -1,
                "error": format!("Unknown terminal: {}", params.terminal_id)
            });
        };

        let timeout = params
            .timeout
            .map_or(self.terminal_wait, Duration::from_millis);

        match terminal.wait_for_exit(timeout).await {
            Some(state) => json!({
                "exitCode": state.code_or_negative(),
                "signal": state.signal,
                "output": terminal.take_output().output
            }),
            None => json!({
                "exitCode": -1,
                "timedOut": true,
                "output": terminal.take_output().output
            }),
        }
    }

    fn release_terminal(&self, params: &TerminalIdParams) -> Value {
        if let Some(terminal) = self.terminals.remove(&params.terminal_id) {
            debug!(terminal_id = terminal.id(), "reverse rpc: releasing terminal");
            terminal.terminate();
        }
        json!({ "success": true })
    }

    fn kill_terminal(&self, params: &TerminalIdParams) -> Value {
        if let Some(terminal) = self.terminals.remove(&params.terminal_id) {
            debug!(terminal_id = terminal.id(), "reverse rpc: killing terminal");
            terminal.kill();
        }
        json!({ "success": true })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl InboundHandler for ReverseRpcHandler {
    fn on_notification(&self, notification: Message) {
        debug!(
            method = notification.method().unwrap_or("-"),
            "reverse rpc: ignoring notification"
        );
    }

    fn on_request(self: Arc<Self>, request: Message) -> ResponseFuture {
        Box::pin(async move { self.handle(&request).await })
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse<T: DeserializeOwned>(method: &str, params: &Value) -> Result<T> {
    T::deserialize(params).map_err(|e| AppError::Acp(format!("invalid params for {method}: {e}")))
}

/// Lines `line..line + limit` (1-based) of `content`, line endings kept.
fn slice_lines(content: &str, line: Option<usize>, limit: Option<usize>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_owned();
    }
    let skip = line.unwrap_or(1).saturating_sub(1);
    let take = limit.unwrap_or(usize::MAX);
    content.split_inclusive('\n').skip(skip).take(take).collect()
}

/// Pick the first `allow_*` option, else the first option of any kind.
fn pick_allow_option(params: &Value) -> Option<&str> {
    let options = params.get("options").and_then(Value::as_array)?;

    options
        .iter()
        .find(|opt| {
            opt.get("kind")
                .and_then(Value::as_str)
                .is_some_and(|kind| kind.starts_with("allow"))
        })
        .or_else(|| options.first())
        .and_then(|opt| opt.get("optionId"))
        .and_then(Value::as_str)
}

/// Create parent directories, then write through a temp file and rename.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| AppError::FsWrite(format!("{}: no parent directory", path.display())))?;

    std::fs::create_dir_all(parent).map_err(|e| {
        AppError::FsWrite(format!(
            "failed to create parent directories for {}: {e}",
            path.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|e| AppError::FsWrite(format!("failed to create temporary file: {e}")))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| AppError::FsWrite(format!("failed to write temporary file: {e}")))?;
    tmp.persist(path)
        .map_err(|e| AppError::FsWrite(format!("failed to persist {}: {e}", path.display())))?;
    Ok(())
}

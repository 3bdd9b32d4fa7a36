//! Managed terminals backing the agent's `terminal/*` requests.
//!
//! A [`ManagedTerminal`] is a host-spawned subprocess whose stdout and stderr
//! are appended to one shared buffer. Three background tasks serve it: one
//! capture task per stream, and a waiter that owns the [`Child`] and
//! publishes its exit status through a `watch` channel once both streams have
//! drained. Kill requests reach the waiter through a [`CancellationToken`].
//!
//! Terminals live in a [`TerminalTable`]; dropping the table force-kills
//! every terminal still in it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::lock_unpoisoned;
use crate::acp::spawner::request_terminate;
use crate::{AppError, Result};

/// How long the waiter lets the capture tasks drain after exit.
///
/// A background grandchild can hold the pipes open indefinitely.
const DRAIN_AFTER_EXIT: Duration = Duration::from_millis(500);

/// What to run for `terminal/create`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalRequest {
    /// Shell command line, or the executable when `args` is set.
    pub command: String,
    /// Direct argument vector; `None` runs `command` through the shell.
    pub args: Option<Vec<String>>,
    /// Working directory; inherited when `None`.
    pub cwd: Option<PathBuf>,
    /// Environment overrides.
    pub env: Vec<(String, String)>,
    /// Keep at most this many of the newest output bytes.
    pub output_byte_limit: Option<usize>,
}

/// How a terminal's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    /// Exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    /// Terminating signal on unix.
    pub signal: Option<i32>,
}

impl ExitState {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: exit_signal(status),
        }
    }

    /// Exit code, `-1` when there is none.
    #[must_use]
    pub fn code_or_negative(&self) -> i32 {
        self.code.unwrap_or(-1)
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Output drained from a terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalOutput {
    /// Text captured since the previous drain.
    pub output: String,
    /// Whether older bytes were discarded to honour the byte limit.
    pub truncated: bool,
}

#[derive(Debug, Default)]
struct OutputBuffer {
    data: String,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    fn append(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        let Some(limit) = self.limit else {
            return;
        };
        if self.data.len() <= limit {
            return;
        }
        let mut cut = self.data.len() - limit;
        while !self.data.is_char_boundary(cut) {
            cut += 1;
        }
        self.data.drain(..cut);
        self.truncated = true;
    }

    fn take(&mut self) -> TerminalOutput {
        TerminalOutput {
            output: std::mem::take(&mut self.data),
            truncated: std::mem::replace(&mut self.truncated, false),
        }
    }
}

/// A subprocess run on the agent's behalf.
#[derive(Debug)]
pub struct ManagedTerminal {
    id: String,
    pid: Option<u32>,
    output: Arc<Mutex<OutputBuffer>>,
    exit: watch::Receiver<Option<ExitState>>,
    kill: CancellationToken,
}

impl ManagedTerminal {
    /// Spawn `request` as terminal `id`.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// `AppError::TerminalCreate` if the process cannot be spawned.
    pub fn spawn(id: impl Into<String>, request: &TerminalRequest) -> Result<Self> {
        let id = id.into();
        let mut cmd = build_command(request);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            AppError::TerminalCreate(format!("failed to spawn `{}`: {e}", request.command))
        })?;
        let pid = child.id();

        let output = Arc::new(Mutex::new(OutputBuffer {
            limit: request.output_byte_limit,
            ..OutputBuffer::default()
        }));

        let mut captures = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            captures.push(tokio::spawn(capture(stdout, Arc::clone(&output))));
        }
        if let Some(stderr) = child.stderr.take() {
            captures.push(tokio::spawn(capture(stderr, Arc::clone(&output))));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        tokio::spawn(wait_child(id.clone(), child, captures, kill.clone(), exit_tx));

        info!(
            terminal_id = id.as_str(),
            pid = pid.unwrap_or(0),
            command = request.command.as_str(),
            "terminal spawned"
        );

        Ok(Self {
            id,
            pid,
            output,
            exit: exit_rx,
            kill,
        })
    }

    /// Terminal id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drain and clear the buffered output.
    #[must_use]
    pub fn take_output(&self) -> TerminalOutput {
        lock_unpoisoned(&self.output).take()
    }

    /// Exit state, once the process has exited and its output drained.
    #[must_use]
    pub fn exit_state(&self) -> Option<ExitState> {
        *self.exit.borrow()
    }

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Returns `None` on timeout.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ExitState> {
        let mut exit = self.exit.clone();
        let waited = tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(state)) => *state,
            // Waiter gone without publishing: the runtime is shutting down.
            Ok(Err(_)) => Some(ExitState {
                code: None,
                signal: None,
            }),
            Err(_) => None,
        }
    }

    /// Ask the process to terminate; falls back to a hard kill when no
    /// graceful signal can be delivered.
    pub fn terminate(&self) {
        if self.exit_state().is_some() {
            return;
        }
        if !request_terminate(self.pid) {
            self.kill();
        }
    }

    /// Force-kill the process.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

fn build_command(request: &TerminalRequest) -> Command {
    let mut cmd = match &request.args {
        Some(args) => {
            let mut cmd = Command::new(&request.command);
            cmd.args(args);
            cmd
        }
        None => shell_command(&request.command),
    };
    if let Some(cwd) = &request.cwd {
        cmd.current_dir(cwd);
    }
    for (name, value) in &request.env {
        cmd.env(name, value);
    }
    cmd
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

/// Decodes process output into text without splitting a multibyte
/// character across reads.
///
/// An incomplete sequence at the end of the buffer waits for the next read;
/// genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Chunks;

impl Decoder for Utf8Chunks {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<String>> {
        let complete = match std::str::from_utf8(src) {
            Ok(_) => src.len(),
            Err(e) => match e.error_len() {
                None => e.valid_up_to(),
                Some(invalid) => e.valid_up_to() + invalid,
            },
        };
        if complete == 0 {
            return Ok(None);
        }
        let chunk = src.split_to(complete);
        Ok(Some(String::from_utf8_lossy(&chunk).into_owned()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::io::Result<Option<String>> {
        if let Some(text) = self.decode(src)? {
            return Ok(Some(text));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Truncated character at EOF.
        let rest = src.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

/// Append everything read from `stream` to `output` until EOF.
async fn capture<R>(stream: R, output: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stream, Utf8Chunks);
    while let Some(chunk) = framed.next().await {
        match chunk {
            Ok(text) => lock_unpoisoned(&output).append(&text),
            Err(e) => {
                debug!(error = %e, "terminal capture: read error, stopping");
                break;
            }
        }
    }
}

/// Own the child until it exits, then publish its exit state.
async fn wait_child(
    id: String,
    mut child: Child,
    captures: Vec<JoinHandle<()>>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitState>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(terminal_id = id.as_str(), error = %e, "terminal kill failed");
            }
            child.wait().await
        }
    };

    for capture in captures {
        if tokio::time::timeout(DRAIN_AFTER_EXIT, capture).await.is_err() {
            debug!(terminal_id = id.as_str(), "terminal capture still open after exit");
        }
    }

    let state = match status {
        Ok(status) => ExitState::from_status(status),
        Err(e) => {
            warn!(terminal_id = id.as_str(), error = %e, "terminal wait failed");
            ExitState {
                code: None,
                signal: None,
            }
        }
    };
    debug!(terminal_id = id.as_str(), ?state, "terminal exited");
    let _ = exit_tx.send(Some(state));
}

/// Terminals owned by one reverse-RPC handler, keyed by id.
#[derive(Debug, Default)]
pub struct TerminalTable {
    terminals: Mutex<HashMap<String, Arc<ManagedTerminal>>>,
}

impl TerminalTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `terminal`. A terminal already registered under the same id is
    /// force-killed and replaced.
    pub fn insert(&self, terminal: ManagedTerminal) -> Arc<ManagedTerminal> {
        let terminal = Arc::new(terminal);
        let replaced =
            lock_unpoisoned(&self.terminals).insert(terminal.id.clone(), Arc::clone(&terminal));
        if let Some(old) = replaced {
            warn!(terminal_id = old.id(), "terminal id reused, killing previous process");
            old.kill();
        }
        terminal
    }

    /// Look up a terminal.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ManagedTerminal>> {
        lock_unpoisoned(&self.terminals).get(id).cloned()
    }

    /// Remove a terminal without touching its process.
    #[must_use]
    pub fn remove(&self, id: &str) -> Option<Arc<ManagedTerminal>> {
        lock_unpoisoned(&self.terminals).remove(id)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.terminals).len()
    }

    /// `true` when no terminal is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and force-kill every terminal.
    pub fn kill_all(&self) {
        let drained: Vec<_> = lock_unpoisoned(&self.terminals).drain().collect();
        for (id, terminal) in drained {
            debug!(terminal_id = id.as_str(), "killing orphaned terminal");
            terminal.kill();
        }
    }
}

impl Drop for TerminalTable {
    fn drop(&mut self) {
        self.kill_all();
    }
}

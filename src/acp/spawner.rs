//! ACP agent process spawner.
//!
//! Spawns the agent subprocess with:
//! - the configured argument vector (no shell in between),
//! - the caller's environment overrides laid over the inherited environment,
//! - the command's own directory prepended to `PATH` so sibling helpers
//!   (e.g. a `node` shipped next to the agent script) resolve,
//! - `kill_on_drop(true)` so a dropped handle never leaves an orphan.
//!
//! [`terminate_child`] implements the shutdown sequence: SIGTERM, a bounded
//! grace period, then SIGKILL.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Launch contract for an agent subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable path or name resolved through `PATH`.
    pub command: String,
    /// Argument vector passed verbatim.
    pub args: Vec<String>,
    /// Environment overrides merged onto the inherited environment.
    pub env: HashMap<String, String>,
    /// Working directory; inherited when `None`.
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Launch `command` with `args`, inheriting environment and directory.
    #[must_use]
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add one environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// One-line rendering of the command for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Live agent subprocess with its three captured streams.
#[derive(Debug)]
pub struct AgentProcess {
    /// Child handle; `kill_on_drop(true)` is set.
    pub child: Child,
    /// Agent's stdin, the protocol write side.
    pub stdin: ChildStdin,
    /// Agent's stdout, the protocol read side.
    pub stdout: ChildStdout,
    /// Agent's stderr, diagnostics only.
    pub stderr: ChildStderr,
}

/// Spawn the agent described by `spec`.
///
/// # Errors
///
/// - `AppError::Startup("failed to spawn agent: …")` if the OS refuses the spawn.
/// - `AppError::Startup("failed to capture agent …")` if a pipe was not set up.
pub fn spawn_agent(spec: &LaunchSpec) -> Result<AgentProcess> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    if let Some(path) = path_with_command_dir(spec) {
        cmd.env("PATH", path);
    }

    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Startup(format!("failed to spawn agent `{}`: {err}", spec.command))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Startup("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Startup("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Startup("failed to capture agent stderr".into()))?;

    info!(
        pid = child.id().unwrap_or(0),
        command = %spec.summary(),
        "agent process spawned"
    );

    Ok(AgentProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Stop `child`: SIGTERM, wait up to `grace`, then force-kill.
///
/// A child that has already exited is reaped and left alone.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(?status, "child already exited");
            return;
        }
        Ok(None) => {}
        Err(err) => warn!(%err, "failed to poll child status before terminate"),
    }

    if !request_terminate(child.id()) {
        // No graceful signal available; go straight to the hard kill.
        if let Err(err) = child.kill().await {
            warn!(%err, "failed to kill child process");
        }
        return;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(?status, "child process exited after terminate"),
        Ok(Err(err)) => warn!(%err, "error waiting for child process"),
        Err(_) => {
            warn!(
                grace_ms = grace.as_millis(),
                "child did not exit within grace period, forcing kill"
            );
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to force-kill child process");
            }
        }
    }
}

/// Ask process `pid` to terminate gracefully.
///
/// Returns `false` when no graceful signal could be delivered (unknown pid,
/// or a platform without SIGTERM); callers then fall back to a hard kill.
#[cfg(unix)]
#[must_use]
pub fn request_terminate(pid: Option<u32>) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            debug!(pid = raw, %err, "SIGTERM delivery failed");
            false
        }
    }
}

/// Ask process `pid` to terminate gracefully.
///
/// Without SIGTERM there is no graceful path, so this always returns `false`.
#[cfg(not(unix))]
#[must_use]
pub fn request_terminate(_pid: Option<u32>) -> bool {
    false
}

/// `PATH` for the child with the command's parent directory in front, or
/// `None` when the command has no directory component.
fn path_with_command_dir(spec: &LaunchSpec) -> Option<OsString> {
    let dir = Path::new(&spec.command).parent()?;
    if dir.as_os_str().is_empty() {
        return None;
    }

    let inherited = spec
        .env
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_default();

    let mut entries = vec![dir.to_path_buf()];
    entries.extend(std::env::split_paths(&inherited));
    std::env::join_paths(entries).ok()
}

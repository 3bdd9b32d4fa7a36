//! Host configuration parsing and validation.
//!
//! The configuration supplies the agent launch contract (command, arguments,
//! environment overrides, working directory), protocol timeouts, and the
//! permission policy applied to `session/request_permission`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::acp::spawner::LaunchSpec;
use crate::{AppError, Result};

/// How to launch the ACP agent subprocess.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent executable (e.g., `gemini`, `/usr/local/bin/claude-code-acp`).
    #[serde(default)]
    pub command: String,
    /// Arguments passed to the agent executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides merged onto the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the agent process; inherited when absent.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Configurable timeout values for protocol interactions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Bound on `initialize` and `session/new`.
    #[serde(default = "default_initialize_seconds")]
    pub initialize_seconds: u64,
    /// Bound on other host-issued requests.
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// Bound on a prompt turn; 0 means no timeout.
    #[serde(default)]
    pub prompt_seconds: u64,
    /// Grace period between SIGTERM and SIGKILL when closing the agent.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    /// Default bound for `terminal/wait_for_exit` when the agent omits one.
    #[serde(default = "default_terminal_wait_ms")]
    pub terminal_wait_ms: u64,
}

fn default_initialize_seconds() -> u64 {
    30
}

fn default_request_seconds() -> u64 {
    120
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

fn default_terminal_wait_ms() -> u64 {
    30_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initialize_seconds: default_initialize_seconds(),
            request_seconds: default_request_seconds(),
            prompt_seconds: 0,
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            terminal_wait_ms: default_terminal_wait_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Handshake bound as a [`Duration`].
    #[must_use]
    pub fn initialize(&self) -> Duration {
        Duration::from_secs(self.initialize_seconds)
    }

    /// Generic request bound as a [`Duration`].
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_seconds)
    }

    /// Prompt-turn bound, or `None` when prompt turns are unbounded.
    #[must_use]
    pub fn prompt(&self) -> Option<Duration> {
        (self.prompt_seconds > 0).then(|| Duration::from_secs(self.prompt_seconds))
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// Default terminal wait as a [`Duration`].
    #[must_use]
    pub fn terminal_wait(&self) -> Duration {
        Duration::from_millis(self.terminal_wait_ms)
    }
}

/// Policy applied to agent permission requests.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PermissionConfig {
    /// Grant every `session/request_permission` without prompting.
    #[serde(default = "default_true")]
    pub auto_approve: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self { auto_approve: true }
    }
}

/// Host configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HostConfig {
    /// Agent launch contract.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Timeout configuration for protocol flows.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Permission policy for reverse-RPC permission requests.
    #[serde(default)]
    pub permissions: PermissionConfig,
}

impl HostConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the launch contract for the configured agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no agent command is configured.
    pub fn launch_spec(&self) -> Result<LaunchSpec> {
        let command = self.agent.command.trim();
        if command.is_empty() {
            return Err(AppError::Config("agent command is not configured".into()));
        }

        Ok(LaunchSpec {
            command: command.to_owned(),
            args: self.agent.args.clone(),
            env: self.agent.env.clone(),
            working_dir: self.agent.working_dir.clone(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.timeouts.initialize_seconds == 0 {
            return Err(AppError::Config(
                "initialize_seconds must be greater than zero".into(),
            ));
        }

        if self.timeouts.request_seconds == 0 {
            return Err(AppError::Config(
                "request_seconds must be greater than zero".into(),
            ));
        }

        if self.timeouts.shutdown_grace_seconds == 0 {
            return Err(AppError::Config(
                "shutdown_grace_seconds must be greater than zero".into(),
            ));
        }

        if let Some(dir) = &self.agent.working_dir {
            if !dir.is_dir() {
                return Err(AppError::Config(format!(
                    "agent working_dir is not a directory: {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }
}

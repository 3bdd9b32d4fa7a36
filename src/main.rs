#![forbid(unsafe_code)]

//! `acp-host`: run one prompt turn against an ACP agent.
//!
//! Spawns the configured agent, performs the handshake, opens a session,
//! streams the agent's reply to stdout, and shuts the agent down. Ctrl-C
//! during the turn sends `session/cancel` and waits for the agent to stop.
//! Logs go to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use acp_host::acp::update::{SessionUpdate, UpdateKind};
use acp_host::{AppError, HostConfig, Result, SessionManager};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-host", about = "Run a prompt against an ACP agent", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Working directory for the session (defaults to the agent's working_dir).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Also print the agent's reasoning chunks (to stderr).
    #[arg(long)]
    show_thoughts: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Prompt text; multiple words are joined with spaces.
    #[arg(required = true)]
    prompt: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = HostConfig::load_from_path(&args.config)?;
    let cwd = resolve_cwd(args.cwd.as_deref(), &config)?;
    info!(cwd = %cwd.display(), "configuration loaded");

    let manager = Arc::new(SessionManager::new(config));
    let show_thoughts = args.show_thoughts;
    manager.add_update_listener(move |update| render_update(update, show_thoughts));

    let outcome = run_turn(&manager, &cwd, &args.prompt.join(" ")).await;
    manager.shutdown().await;

    if let Err(err) = &outcome {
        if err.is_agent_unavailable() {
            error!(%err, "agent not available");
        } else {
            error!(%err, "prompt turn failed");
        }
    }
    outcome
}

async fn run_turn(manager: &SessionManager, cwd: &Path, prompt: &str) -> Result<()> {
    manager.ensure_initialized().await?;
    let session_id = manager.new_session(cwd).await?;

    let turn = manager.send_prompt(&session_id, prompt);
    tokio::pin!(turn);

    let stop_reason = tokio::select! {
        reason = &mut turn => reason?,
        () = interrupt() => {
            info!(session_id = session_id.as_str(), "interrupt received, cancelling turn");
            manager.cancel_session(&session_id).await?;
            turn.await?
        }
    };

    // Terminate the streamed reply before the summary line.
    println!();
    eprintln!("stop reason: {stop_reason}");
    Ok(())
}

fn resolve_cwd(cli: Option<&Path>, config: &HostConfig) -> Result<PathBuf> {
    let dir = match cli.or(config.agent.working_dir.as_deref()) {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()
            .map_err(|err| AppError::Config(format!("cannot determine working directory: {err}")))?,
    };
    dir.canonicalize()
        .map_err(|err| AppError::Config(format!("invalid working directory {}: {err}", dir.display())))
}

fn render_update(update: &SessionUpdate, show_thoughts: bool) {
    match update.kind {
        UpdateKind::AgentMessageChunk => {
            if let Some(text) = &update.text {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
        }
        UpdateKind::AgentThoughtChunk if show_thoughts => {
            if let Some(text) = &update.text {
                eprint!("{text}");
            }
        }
        UpdateKind::ToolCall | UpdateKind::ToolCallUpdate => {
            if let Some(call) = &update.tool_call {
                eprintln!(
                    "[tool] {} ({})",
                    call.title.as_deref().or(call.id.as_deref()).unwrap_or("?"),
                    call.status.as_deref().unwrap_or("pending")
                );
            }
        }
        _ => {}
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn interrupt() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

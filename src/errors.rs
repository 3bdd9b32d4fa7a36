//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// The agent subprocess could not be launched.
    Startup(String),
    /// Write to the agent failed, or the transport closed while a call was outstanding.
    Io(String),
    /// Operation invoked in an invalid lifecycle state.
    State(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// The `initialize` exchange failed or timed out.
    Handshake(String),
    /// `session/new` failed, or a prompt was issued without an active session.
    Session(String),
    /// `fs/read_text_file` could not read the requested path.
    FsRead(String),
    /// `fs/write_text_file` could not write the requested path.
    FsWrite(String),
    /// `terminal/create` could not spawn the requested command.
    TerminalCreate(String),
    /// The agent answered a host-issued request with a JSON-RPC error.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable message supplied by the agent.
        message: String,
    },
    /// A host-issued request failed for any other reason.
    Request(String),
    /// A caller-side timeout elapsed before the response arrived.
    Timeout(String),
    /// Framing or protocol-level violation on the ACP stream.
    Acp(String),
    /// The agent invoked a method this host does not implement.
    Unsupported(String),
}

impl AppError {
    /// Whether this error means the agent could not be brought up at all.
    ///
    /// Surfacing layers use this to report "agent not available" instead of
    /// retrying.
    #[must_use]
    pub fn is_agent_unavailable(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Startup(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Startup(msg) => write!(f, "startup: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::State(msg) => write!(f, "state: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::FsRead(msg) => write!(f, "fs read: {msg}"),
            Self::FsWrite(msg) => write!(f, "fs write: {msg}"),
            Self::TerminalCreate(msg) => write!(f, "terminal create: {msg}"),
            Self::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
            Self::Request(msg) => write!(f, "request: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

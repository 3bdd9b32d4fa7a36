#![forbid(unsafe_code)]

//! `acp-host`: drive coding agents over the Agent Client Protocol.

pub mod acp;
pub mod config;
pub mod errors;

pub use acp::session::{SessionManager, SessionState};
pub use config::HostConfig;
pub use errors::{AppError, Result};

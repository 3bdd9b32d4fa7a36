//! ACP write path.
//!
//! [`Outbound`] owns the agent's `stdin` behind a single async lock and writes
//! each [`Message`] as one NDJSON line through [`AcpCodec`], flushing after
//! every message. Holding the lock for the whole encode-write-flush sequence
//! guarantees lines from concurrent senders never interleave and go out in
//! the order the lock was acquired.
//!
//! The handle is cheap to clone; the transport and every reverse-RPC task
//! share the same underlying writer.

use std::sync::Arc;

use futures_util::SinkExt;
use serde_json::Value;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::acp::message::Message;
use crate::{AppError, Result};

type LineSink = FramedWrite<ChildStdin, AcpCodec>;

/// Serialised writer over the agent's `stdin`.
#[derive(Debug, Clone)]
pub struct Outbound {
    sink: Arc<Mutex<Option<LineSink>>>,
}

impl Outbound {
    /// Wrap the agent's `stdin`.
    #[must_use]
    pub fn new(stdin: ChildStdin) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Some(FramedWrite::new(stdin, AcpCodec::new())))),
        }
    }

    /// A writer with nothing behind it; every send fails with `AppError::Io`.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Write one message and flush.
    ///
    /// # Errors
    ///
    /// - [`AppError::Io`]`("transport is not running")` after [`Outbound::close`].
    /// - [`AppError::Io`]`("write failed: …")` if the agent's `stdin` is gone.
    pub async fn send(&self, message: Message) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(AppError::Io("transport is not running".into()));
        };

        debug!(
            id = ?message.id(),
            method = message.method().unwrap_or("-"),
            "acp writer: sending"
        );

        sink.send(message).await.map_err(|e| {
            warn!(error = %e, "acp writer: write to stdin failed");
            match e {
                AppError::Io(msg) => AppError::Io(format!("write failed: {msg}")),
                other => other,
            }
        })
    }

    /// Write a notification.
    ///
    /// # Errors
    ///
    /// See [`Outbound::send`].
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(Message::notification(method, params)).await
    }

    /// Answer agent request `id` with `result`.
    ///
    /// # Errors
    ///
    /// See [`Outbound::send`].
    pub async fn send_response(&self, id: u64, result: Value) -> Result<()> {
        self.send(Message::response(id, result)).await
    }

    /// Answer agent request `id` with a JSON-RPC error.
    ///
    /// # Errors
    ///
    /// See [`Outbound::send`].
    pub async fn send_error_response(&self, id: u64, code: i64, message: &str) -> Result<()> {
        self.send(Message::error_response(id, code, message)).await
    }

    /// Flush and close the writer. Idempotent.
    ///
    /// Closing `stdin` delivers EOF to the agent.
    pub async fn close(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "acp writer: error closing stdin");
            }
        }
    }

    /// Whether the writer still has a live `stdin`.
    pub async fn is_open(&self) -> bool {
        self.sink.lock().await.is_some()
    }
}

//! ACP reader tasks.
//!
//! [`run_reader`] reads newline-delimited JSON-RPC envelopes from the agent's
//! stdout and dispatches each one by kind:
//!
//! | Kind           | Action                                                  |
//! |----------------|---------------------------------------------------------|
//! | response       | settles the matching pending call                       |
//! | notification   | inline call to [`InboundHandler::on_notification`]      |
//! | request        | spawned task running [`InboundHandler::on_request`]     |
//! | invalid        | dropped; logged at `WARN`                               |
//!
//! Notifications are delivered on the reader task itself, so they reach the
//! handler in arrival order. Requests run concurrently so a slow `fs/*` or
//! `terminal/*` call never stalls the stream.
//!
//! Blank, malformed, oversized, and non-UTF-8 lines are logged and skipped;
//! they do **not** end the reader. End of stream or an I/O error marks the connection closed and
//! fails every outstanding call.
//!
//! [`run_stderr_drain`] forwards agent stderr lines to the log at `WARN`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::codec::AcpCodec;
use crate::acp::message::{Message, MessageKind, INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::acp::transport::{Connection, InboundHandler};

/// Reader task: drive `stdout` until EOF, I/O error, or cancellation.
///
/// On EOF or I/O error the connection is marked closed, which fails all
/// pending calls with `AppError::Io("transport closed")`. Cancellation exits
/// quietly; whoever cancelled owns the teardown.
pub(crate) async fn run_reader<R>(
    stdout: R,
    conn: Arc<Connection>,
    handler: Option<Arc<dyn InboundHandler>>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, AcpCodec::new());
    let cancel = conn.cancel_token();

    let reason = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("acp reader: cancellation received, stopping");
                return;
            }

            item = framed.next() => {
                match item {
                    None => break "stream closed",

                    Some(Err(e)) => {
                        warn!(error = %e, "acp reader: IO error, stopping");
                        break "stream error";
                    }

                    Some(Ok(line)) => dispatch_line(&conn, handler.as_ref(), &line),
                }
            }
        }
    };

    let failed = conn.mark_closed();
    info!(reason, failed, "acp reader: agent stream ended");
}

/// Decode one wire line and route it.
pub(crate) fn dispatch_line(
    conn: &Connection,
    handler: Option<&Arc<dyn InboundHandler>>,
    line: &str,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let message = match Message::from_line(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, raw_line = line, "acp reader: parse error, skipping line");
            return;
        }
    };

    match message.kind() {
        MessageKind::Response => {
            if !conn.pending().settle(message) {
                debug!("acp reader: response settled nothing");
            }
        }
        MessageKind::Notification => deliver_notification(handler, message),
        MessageKind::Request => spawn_request(conn, handler, message),
        MessageKind::Invalid => {
            warn!(raw_line = line, "acp reader: envelope has neither method nor id, dropping");
        }
    }
}

/// Run the notification callback inline, containing any panic.
fn deliver_notification(handler: Option<&Arc<dyn InboundHandler>>, message: Message) {
    let Some(handler) = handler else {
        debug!(
            method = message.method().unwrap_or("-"),
            "acp reader: no handler for notification"
        );
        return;
    };

    let method = message.method().unwrap_or("-").to_owned();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_notification(message)));
    if outcome.is_err() {
        warn!(method, "acp reader: notification handler panicked");
    }
}

/// Answer an agent-initiated request on its own task.
///
/// A panicking handler is answered with `INTERNAL_ERROR` so the agent is
/// never left waiting.
fn spawn_request(conn: &Connection, handler: Option<&Arc<dyn InboundHandler>>, message: Message) {
    let outbound = conn.outbound();
    let id = message.id().unwrap_or_default();
    let method = message.method().unwrap_or_default().to_owned();
    let handler = handler.map(Arc::clone);

    tokio::spawn(async move {
        let response = match handler {
            None => Message::error_response(
                id,
                METHOD_NOT_FOUND,
                format!("Method not supported: {method}"),
            ),
            Some(handler) => {
                let started =
                    std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_request(message)));
                let outcome = match started {
                    Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                    Err(panic) => Err(panic),
                };
                outcome.unwrap_or_else(|_| {
                    warn!(id, method, "acp reader: request handler panicked");
                    Message::error_response(id, INTERNAL_ERROR, "request handler panicked")
                })
            }
        };

        if let Err(e) = outbound.send(response).await {
            warn!(id, method, error = %e, "acp reader: failed to answer agent request");
        }
    });
}

/// Forward each agent stderr line to the log at `WARN`.
///
/// Stops at EOF, on I/O error, or when `cancel` fires.
pub(crate) async fn run_stderr_drain<R>(stderr: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stderr, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            item = framed.next() => {
                match item {
                    Some(Ok(line)) => {
                        if !line.trim().is_empty() {
                            warn!(target: "acp_host::agent_stderr", line = line.as_str(), "agent stderr");
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "acp stderr drain: IO error, stopping");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

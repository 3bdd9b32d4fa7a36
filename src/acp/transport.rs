//! Bidirectional JSON-RPC transport over an agent subprocess.
//!
//! A [`Transport`] spawns the agent, owns its stdio, and multiplexes
//! host-issued requests with agent-issued requests and notifications over
//! one NDJSON stream:
//!
//! - outbound requests get a fresh id from a per-transport counter (starting
//!   at 1, never reused) and a [`PendingCall`] settled by the reader task;
//! - responses are matched to pending calls by id, in whatever order the
//!   agent sends them;
//! - agent requests and notifications go to the [`InboundHandler`] supplied
//!   at construction.
//!
//! # Lifecycle
//!
//! [`Transport::start`] spawns the process and the reader tasks.
//! [`Transport::close`] is idempotent: it fails every pending call, closes
//! `stdin`, sends SIGTERM, waits up to the grace period, force-kills, and
//! stops the reader. If the agent exits on its own, the reader observes EOF
//! and fails pending calls the same way.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::lock_unpoisoned;
use crate::acp::message::Message;
use crate::acp::reader::{run_reader, run_stderr_drain};
use crate::acp::spawner::{spawn_agent, terminate_child, LaunchSpec};
use crate::acp::writer::Outbound;
use crate::{AppError, Result};

/// Default timeout for [`Transport::send_request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Default wait between SIGTERM and SIGKILL in [`Transport::close`].
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Boxed future returned by [`InboundHandler::on_request`].
pub type ResponseFuture = Pin<Box<dyn Future<Output = Message> + Send>>;

// ── Inbound handler ───────────────────────────────────────────────────────────

/// Receiver for agent-initiated traffic.
pub trait InboundHandler: Send + Sync + 'static {
    /// Called on the reader task, in arrival order, for every notification.
    ///
    /// Must not block; a panic is caught and logged.
    fn on_notification(&self, notification: Message);

    /// Produce the response to an agent request.
    ///
    /// The transport writes whatever message the future resolves to. A panic
    /// becomes an `INTERNAL_ERROR` response.
    fn on_request(self: Arc<Self>, request: Message) -> ResponseFuture;
}

// ── Pending call table ────────────────────────────────────────────────────────

type Settle = oneshot::Sender<Result<Message>>;

/// Outstanding host-issued requests keyed by id.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    slots: Mutex<HashMap<u64, Settle>>,
}

impl PendingTable {
    fn register(&self, id: u64) -> oneshot::Receiver<Result<Message>> {
        let (tx, rx) = oneshot::channel();
        lock_unpoisoned(&self.slots).insert(id, tx);
        rx
    }

    fn forget(&self, id: u64) -> bool {
        lock_unpoisoned(&self.slots).remove(&id).is_some()
    }

    fn len(&self) -> usize {
        lock_unpoisoned(&self.slots).len()
    }

    /// Settle the call matching `response`. Returns `false` for unknown ids.
    pub(crate) fn settle(&self, response: Message) -> bool {
        let Some(id) = response.id() else {
            return false;
        };
        let Some(tx) = lock_unpoisoned(&self.slots).remove(&id) else {
            warn!(id, "acp transport: response for unknown request id, ignoring");
            return false;
        };

        let outcome = match response.error() {
            Some(err) => Err(AppError::Rpc {
                code: err.code,
                message: err.message.clone(),
            }),
            None => Ok(response),
        };
        // The caller may have stopped waiting; nothing to do then.
        let _ = tx.send(outcome);
        true
    }

    /// Fail every outstanding call with `AppError::Io(reason)`.
    fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<Settle> = lock_unpoisoned(&self.slots).drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(AppError::Io(reason.to_owned())));
        }
        count
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// State of one started agent process.
///
/// A fresh connection is built on every [`Transport::start`], so a reader
/// left over from a previous process can never touch the calls of the
/// current one.
pub(crate) struct Connection {
    pending: PendingTable,
    outbound: Outbound,
    running: AtomicBool,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub(crate) fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Flag the connection as closed and fail all pending calls.
    pub(crate) fn mark_closed(&self) -> usize {
        self.running.store(false, Ordering::SeqCst);
        self.pending.fail_all("transport closed")
    }

    /// Register a pending call for `id`, failing if the connection closed.
    ///
    /// [`Connection::mark_closed`] clears `running` before draining the
    /// table, so an entry inserted after the drain is caught by the check
    /// below.
    fn register_call(&self, id: u64) -> Result<oneshot::Receiver<Result<Message>>> {
        let rx = self.pending.register(id);
        if self.running.load(Ordering::SeqCst) {
            Ok(rx)
        } else {
            self.pending.forget(id);
            Err(AppError::Io("transport closed".into()))
        }
    }

    fn is_alive(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        lock_unpoisoned(&self.child)
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    fn abort_tasks(&self) {
        self.cancel.cancel();
        for task in lock_unpoisoned(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

// ── Pending call future ───────────────────────────────────────────────────────

/// Future for the response to one host-issued request.
///
/// Resolves to the response message on success, `AppError::Rpc` when the
/// agent answers with an error, or `AppError::Io` if the transport closes
/// first. Dropping it forgets the call.
#[must_use = "a pending call does nothing unless awaited"]
pub struct PendingCall {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Result<Message>>,
    conn: Weak<Connection>,
}

impl PendingCall {
    /// Id of the request on the wire.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Method of the request.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait at most `timeout` for the response.
    ///
    /// On expiry the call is removed from the pending table, so a late
    /// response is discarded.
    ///
    /// # Errors
    ///
    /// `AppError::Timeout` on expiry, otherwise as for awaiting the call.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Message> {
        let id = self.id;
        let method = self.method.clone();
        if let Ok(outcome) = tokio::time::timeout(timeout, self).await {
            outcome
        } else {
            // Dropping the call above already removed it from the table.
            warn!(id, method, timeout_ms = timeout.as_millis(), "acp transport: request timed out");
            Err(AppError::Timeout(format!(
                "{method} (id {id}) got no response within {}ms",
                timeout.as_millis()
            )))
        }
    }
}

impl Future for PendingCall {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(AppError::Io("transport closed".into())))
        })
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.pending.forget(self.id);
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// JSON-RPC connection to one agent subprocess.
pub struct Transport {
    handler: Option<Arc<dyn InboundHandler>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    shutdown_grace: Duration,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl Transport {
    /// Transport with no inbound handler.
    ///
    /// Agent requests are answered with `METHOD_NOT_FOUND` and notifications
    /// are dropped.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Transport that routes agent traffic to `handler`.
    #[must_use]
    pub fn with_handler(handler: Arc<dyn InboundHandler>) -> Self {
        Self::build(Some(handler))
    }

    fn build(handler: Option<Arc<dyn InboundHandler>>) -> Self {
        Self {
            handler,
            next_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            connection: Mutex::new(None),
        }
    }

    /// Override the timeout used by [`Transport::send_request`].
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the SIGTERM grace period used by [`Transport::close`].
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Spawn the agent and start the reader tasks.
    ///
    /// A previous connection whose process has exited is cleaned up first.
    ///
    /// # Errors
    ///
    /// - `AppError::State` if the transport is already running.
    /// - `AppError::Startup` if the process cannot be spawned.
    pub async fn start(&self, spec: &LaunchSpec) -> Result<()> {
        if self.is_running() {
            return Err(AppError::State("transport is already running".into()));
        }
        self.close().await;

        let process = spawn_agent(spec)?;
        let conn = Arc::new(Connection {
            pending: PendingTable::default(),
            outbound: Outbound::new(process.stdin),
            running: AtomicBool::new(true),
            child: Mutex::new(Some(process.child)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(run_reader(
            process.stdout,
            Arc::clone(&conn),
            self.handler.clone(),
        ));
        let drain = tokio::spawn(run_stderr_drain(process.stderr, conn.cancel_token()));
        lock_unpoisoned(&conn.tasks).extend([reader, drain]);

        *lock_unpoisoned(&self.connection) = Some(conn);
        info!(command = %spec.summary(), "acp transport started");
        Ok(())
    }

    /// Write a request and return the future of its response.
    ///
    /// # Errors
    ///
    /// `AppError::Io` if the transport is not running or the write fails.
    pub async fn issue_request(&self, method: &str, params: Option<Value>) -> Result<PendingCall> {
        let conn = self.live_connection()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let call = PendingCall {
            id,
            method: method.to_owned(),
            rx: conn.register_call(id)?,
            conn: Arc::downgrade(&conn),
        };

        conn.outbound
            .send(Message::request(id, method, params))
            .await?;
        debug!(id, method, "acp transport: request sent");
        Ok(call)
    }

    /// Send a request and wait up to the default timeout for its response.
    ///
    /// # Errors
    ///
    /// See [`Transport::send_request_with_timeout`].
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Message> {
        self.send_request_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// # Errors
    ///
    /// - `AppError::Io` if not running, the write fails, or the transport
    ///   closes before the response.
    /// - `AppError::Rpc` if the agent answers with an error.
    /// - `AppError::Timeout` on expiry.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Message> {
        self.issue_request(method, params)
            .await?
            .wait_timeout(timeout)
            .await
    }

    /// Write a notification.
    ///
    /// # Errors
    ///
    /// `AppError::Io` if the transport is not running or the write fails.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let conn = self.live_connection()?;
        conn.outbound.send_notification(method, params).await
    }

    /// Answer agent request `id` with `result`.
    ///
    /// Agent requests routed to an [`InboundHandler`] are answered
    /// automatically; this is for callers answering out of band.
    ///
    /// # Errors
    ///
    /// `AppError::Io` if the transport is not running or the write fails.
    pub async fn send_response(&self, id: u64, result: Value) -> Result<()> {
        let conn = self.live_connection()?;
        conn.outbound.send_response(id, result).await
    }

    /// Answer agent request `id` with a JSON-RPC error.
    ///
    /// # Errors
    ///
    /// `AppError::Io` if the transport is not running or the write fails.
    pub async fn send_error_response(&self, id: u64, code: i64, message: &str) -> Result<()> {
        let conn = self.live_connection()?;
        conn.outbound.send_error_response(id, code, message).await
    }

    /// `true` while started, not closed, and the process is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.connection)
            .as_ref()
            .is_some_and(|conn| conn.is_alive())
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock_unpoisoned(&self.connection)
            .as_ref()
            .map_or(0, |conn| conn.pending.len())
    }

    /// Stop the agent and release all resources. Idempotent.
    pub async fn close(&self) {
        let Some(conn) = lock_unpoisoned(&self.connection).take() else {
            return;
        };

        let failed = conn.mark_closed();
        conn.outbound.close().await;

        let child = lock_unpoisoned(&conn.child).take();
        if let Some(mut child) = child {
            terminate_child(&mut child, self.shutdown_grace).await;
        }

        conn.abort_tasks();
        info!(failed, "acp transport closed");
    }

    fn live_connection(&self) -> Result<Arc<Connection>> {
        lock_unpoisoned(&self.connection)
            .as_ref()
            .filter(|conn| conn.running.load(Ordering::SeqCst))
            .map(Arc::clone)
            .ok_or_else(|| AppError::Io("transport is not running".into()))
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .field("request_timeout", &self.request_timeout)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let Some(conn) = lock_unpoisoned(&self.connection).take() else {
            return;
        };
        conn.mark_closed();
        if let Some(child) = lock_unpoisoned(&conn.child).as_mut() {
            if let Err(err) = child.start_kill() {
                debug!(%err, "acp transport: kill on drop failed");
            }
        }
        conn.abort_tasks();
    }
}

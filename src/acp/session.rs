//! ACP session manager.
//!
//! Drives one agent through the session lifecycle:
//!
//! ```text
//! Uninitialized ─► Initializing ─► Initialized ─► SessionActive ⇄ PromptInFlight
//!        ▲               │                                  │
//!        └─── failure ───┘          shutdown() from any state ─► Closed
//! ```
//!
//! `ensure_initialized`, `new_session`, and `shutdown` run inside one async
//! critical section so a handshake can never race a teardown. A prompt turn
//! runs outside it: `cancel_session` and `shutdown` stay usable while the
//! agent is working.
//!
//! `session/update` notifications are parsed into [`SessionUpdate`]s and
//! relayed, in arrival order, to every registered listener. Agent requests
//! are answered by a [`ReverseRpcHandler`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::acp::handler::ReverseRpcHandler;
use crate::acp::handshake::{self, InitializeResult};
use crate::acp::lock_unpoisoned;
use crate::acp::message::Message;
use crate::acp::transport::{InboundHandler, ResponseFuture, Transport};
use crate::acp::update::{SessionUpdate, SESSION_UPDATE_METHOD};
use crate::config::HostConfig;
use crate::{AppError, Result};

/// Stop reason reported when the agent's prompt result has none.
pub const DEFAULT_STOP_REASON: &str = "end_turn";

/// Lifecycle state of a [`SessionManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// No agent process.
    #[default]
    Uninitialized,
    /// Agent spawned, `initialize` outstanding.
    Initializing,
    /// Handshake complete, no session yet.
    Initialized,
    /// A session exists and is idle.
    SessionActive,
    /// A prompt turn is running.
    PromptInFlight,
    /// Shut down; terminal.
    Closed,
}

/// Callback receiving every session update.
pub type UpdateListener = Arc<dyn Fn(&SessionUpdate) + Send + Sync>;

/// Handle returned by [`SessionManager::add_update_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ── Listener registry ─────────────────────────────────────────────────────────

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, UpdateListener)>>,
}

impl ListenerRegistry {
    fn add(&self, listener: UpdateListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Deliver `update` to a snapshot of the listeners. A panicking listener
    /// is logged and skipped.
    fn dispatch(&self, update: &SessionUpdate) {
        let snapshot: Vec<UpdateListener> = self
            .listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            let delivered =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(update)));
            if delivered.is_err() {
                warn!(kind = update.kind.as_str(), "session update listener panicked");
            }
        }
    }
}

/// Routes agent traffic: updates to listeners, requests to the handler.
struct SessionRouter {
    listeners: Arc<ListenerRegistry>,
    rpc: Arc<ReverseRpcHandler>,
}

impl InboundHandler for SessionRouter {
    fn on_notification(&self, notification: Message) {
        if notification.method() != Some(SESSION_UPDATE_METHOD) {
            debug!(
                method = notification.method().unwrap_or("-"),
                "session: ignoring notification"
            );
            return;
        }
        let update = SessionUpdate::from_params(notification.params().unwrap_or(&Value::Null));
        debug!(
            kind = update.kind.as_str(),
            session_id = update.session_id.as_deref().unwrap_or("-"),
            "session: update received"
        );
        self.listeners.dispatch(&update);
    }

    fn on_request(self: Arc<Self>, request: Message) -> ResponseFuture {
        Arc::clone(&self.rpc).on_request(request)
    }
}

// ── Session manager ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    state: SessionState,
    transport: Option<Arc<Transport>>,
    rpc: Option<Arc<ReverseRpcHandler>>,
    session_id: Option<String>,
    agent: Option<InitializeResult>,
}

impl Inner {
    fn transport_alive(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_running())
    }

    fn live_transport(&self) -> Option<Arc<Transport>> {
        self.transport.as_ref().filter(|t| t.is_running()).map(Arc::clone)
    }
}

/// Owns the agent connection and the single active session.
///
/// Construct one per host process and share it behind an `Arc`.
pub struct SessionManager {
    config: HostConfig,
    transition: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
    listeners: Arc<ListenerRegistry>,
}

impl SessionManager {
    /// Manager for the agent described by `config`. Nothing is spawned yet.
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            transition: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner::default()),
            listeners: Arc::new(ListenerRegistry::default()),
        }
    }

    /// Spawn the agent and run `initialize`, unless a live initialized
    /// agent already exists.
    ///
    /// A failed attempt leaves the manager `Uninitialized`; call again to
    /// retry.
    ///
    /// # Errors
    ///
    /// - `AppError::State` after [`SessionManager::shutdown`].
    /// - `AppError::Config` if no agent command is configured.
    /// - `AppError::Startup` if the agent cannot be spawned.
    /// - `AppError::Handshake` if `initialize` fails or times out.
    pub async fn ensure_initialized(&self) -> Result<()> {
        let _transition = self.transition.lock().await;

        let (stale_transport, stale_rpc) = {
            let mut inner = lock_unpoisoned(&self.inner);
            match inner.state {
                SessionState::Closed => {
                    return Err(AppError::State("session manager is shut down".into()));
                }
                SessionState::Initialized
                | SessionState::SessionActive
                | SessionState::PromptInFlight
                    if inner.transport_alive() =>
                {
                    return Ok(());
                }
                _ => {}
            }
            inner.state = SessionState::Initializing;
            inner.session_id = None;
            inner.agent = None;
            (inner.transport.take(), inner.rpc.take())
        };

        if let Some(transport) = stale_transport {
            info!("session: closing stale agent transport");
            transport.close().await;
        }
        if let Some(rpc) = stale_rpc {
            rpc.terminals().kill_all();
        }

        match self.start_agent().await {
            Ok((transport, rpc, agent)) => {
                let mut inner = lock_unpoisoned(&self.inner);
                inner.state = SessionState::Initialized;
                inner.transport = Some(transport);
                inner.rpc = Some(rpc);
                inner.agent = Some(agent);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "session: agent initialization failed");
                lock_unpoisoned(&self.inner).state = SessionState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn start_agent(
        &self,
    ) -> Result<(Arc<Transport>, Arc<ReverseRpcHandler>, InitializeResult)> {
        let spec = self.config.launch_spec()?;
        let root = spec
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let rpc = Arc::new(
            ReverseRpcHandler::new(root)
                .auto_approve(self.config.permissions.auto_approve)
                .terminal_wait(self.config.timeouts.terminal_wait()),
        );
        let router = Arc::new(SessionRouter {
            listeners: Arc::clone(&self.listeners),
            rpc: Arc::clone(&rpc),
        });
        let transport = Arc::new(
            Transport::with_handler(router)
                .request_timeout(self.config.timeouts.request())
                .shutdown_grace(self.config.timeouts.shutdown_grace()),
        );

        transport.start(&spec).await?;

        match handshake::initialize(&transport, self.config.timeouts.initialize()).await {
            Ok(agent) => Ok((transport, rpc, agent)),
            Err(e) => {
                transport.close().await;
                rpc.terminals().kill_all();
                Err(e)
            }
        }
    }

    /// Create a session rooted at `cwd` and make it the active one.
    ///
    /// Allowed while `Initialized`, or `SessionActive` to replace the idle
    /// session.
    ///
    /// # Errors
    ///
    /// - `AppError::State` in any other state.
    /// - `AppError::Session` if `session/new` fails; the state is unchanged.
    pub async fn new_session(&self, cwd: &Path) -> Result<String> {
        let _transition = self.transition.lock().await;

        let transport = {
            let inner = lock_unpoisoned(&self.inner);
            match inner.state {
                SessionState::Initialized | SessionState::SessionActive => {}
                other => {
                    return Err(AppError::State(format!(
                        "cannot create a session while {other:?}"
                    )));
                }
            }
            inner
                .live_transport()
                .ok_or_else(|| AppError::Session("agent transport is not running".into()))?
        };

        let session_id =
            handshake::new_session(&transport, cwd, self.config.timeouts.initialize()).await?;

        let mut inner = lock_unpoisoned(&self.inner);
        inner.session_id = Some(session_id.clone());
        inner.state = SessionState::SessionActive;
        info!(session_id = session_id.as_str(), "session: active");
        Ok(session_id)
    }

    /// Run one prompt turn and return its stop reason.
    ///
    /// Updates streamed during the turn reach the listeners before this
    /// resolves. Only one turn may be in flight at a time.
    ///
    /// # Errors
    ///
    /// - `AppError::Session` without an active session, for a foreign
    ///   session id, or while another turn is in flight.
    /// - `AppError::Request` if the agent answers with an error.
    /// - `AppError::Io` if the transport closes mid-turn.
    /// - `AppError::Timeout` if a prompt timeout is configured and elapses.
    pub async fn send_prompt(&self, session_id: &str, text: &str) -> Result<String> {
        let transport = {
            let mut inner = lock_unpoisoned(&self.inner);
            match inner.state {
                SessionState::SessionActive => {}
                SessionState::PromptInFlight => {
                    return Err(AppError::Session("a prompt turn is already in flight".into()));
                }
                _ => return Err(AppError::Session("no active session".into())),
            }
            if inner.session_id.as_deref() != Some(session_id) {
                return Err(AppError::Session(format!("unknown session: {session_id}")));
            }
            let transport = inner
                .live_transport()
                .ok_or_else(|| AppError::Session("agent transport is not running".into()))?;
            inner.state = SessionState::PromptInFlight;
            transport
        };

        let params = json!({
            "sessionId": session_id,
            "prompt": [{ "type": "text", "text": text }]
        });

        debug!(session_id, "session: prompt sent");
        let outcome = match self.config.timeouts.prompt() {
            Some(limit) => {
                transport
                    .send_request_with_timeout("session/prompt", Some(params), limit)
                    .await
            }
            None => match transport.issue_request("session/prompt", Some(params)).await {
                Ok(call) => call.await,
                Err(e) => Err(e),
            },
        };

        {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.state == SessionState::PromptInFlight {
                inner.state = SessionState::SessionActive;
            }
        }

        let response = outcome.map_err(|e| match e {
            AppError::Rpc { .. } => AppError::Request(format!("session/prompt failed: {e}")),
            other => other,
        })?;

        let stop_reason = response
            .result()
            .and_then(|r| r.get("stopReason"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_STOP_REASON)
            .to_owned();
        info!(session_id, stop_reason = stop_reason.as_str(), "session: prompt turn complete");
        Ok(stop_reason)
    }

    /// Ask the agent to stop the current turn of `session_id`.
    ///
    /// Fire-and-forget: the in-flight [`SessionManager::send_prompt`] still
    /// resolves with whatever the agent answers. A no-op when no agent is
    /// running.
    ///
    /// # Errors
    ///
    /// `AppError::Io` if the notification cannot be written.
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let transport = lock_unpoisoned(&self.inner).live_transport();
        let Some(transport) = transport else {
            debug!(session_id, "session: cancel ignored, agent not running");
            return Ok(());
        };
        info!(session_id, "session: cancel requested");
        transport
            .send_notification("session/cancel", Some(json!({ "sessionId": session_id })))
            .await
    }

    /// Send `ping` and report whether the agent answered at all.
    ///
    /// An error response still counts as an answer.
    pub async fn ping(&self) -> bool {
        let transport = lock_unpoisoned(&self.inner).live_transport();
        let Some(transport) = transport else {
            return false;
        };
        match transport.send_request("ping", None).await {
            Ok(_) | Err(AppError::Rpc { .. }) => true,
            Err(e) => {
                debug!(error = %e, "session: ping failed");
                false
            }
        }
    }

    /// Register a listener for session updates.
    pub fn add_update_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionUpdate) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_update_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Close the agent, kill its terminals, and clear all session state.
    /// Idempotent; the manager cannot be used afterwards.
    pub async fn shutdown(&self) {
        let _transition = self.transition.lock().await;

        let (transport, rpc) = {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.session_id = None;
            inner.agent = None;
            (inner.transport.take(), inner.rpc.take())
        };

        if let Some(transport) = transport {
            transport.close().await;
        }
        if let Some(rpc) = rpc {
            rpc.terminals().kill_all();
        }
        info!("session: shut down");
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        lock_unpoisoned(&self.inner).state
    }

    /// Id of the active session.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        lock_unpoisoned(&self.inner).session_id.clone()
    }

    /// What the agent reported at `initialize`.
    #[must_use]
    pub fn agent_info(&self) -> Option<InitializeResult> {
        lock_unpoisoned(&self.inner).agent.clone()
    }

    /// `true` while the agent process is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.inner).transport_alive()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock_unpoisoned(&self.inner);
        f.debug_struct("SessionManager")
            .field("state", &inner.state)
            .field("session_id", &inner.session_id)
            .finish_non_exhaustive()
    }
}

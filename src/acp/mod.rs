//! Agent Client Protocol (ACP) engine.
//!
//! JSON-RPC 2.0 over an agent subprocess's stdio, layered bottom-up:
//!
//! - [`message`]: the envelope and its classification.
//! - [`codec`]: NDJSON framing for [`tokio_util::codec`].
//! - [`spawner`]: agent process launch and termination.
//! - [`writer`] and `reader`: the single-writer path and the dispatch loop.
//! - [`transport`]: request/response correlation over one process.
//! - [`handshake`]: `initialize` and `session/new`.
//! - [`update`]: `session/update` payloads.
//! - [`terminal`] / [`handler`]: answers to agent-initiated requests.
//! - [`session`]: the session lifecycle state machine.

pub mod codec;
pub mod handler;
pub mod handshake;
pub mod message;
pub(crate) mod reader;
pub mod session;
pub mod spawner;
pub mod terminal;
pub mod transport;
pub mod update;
pub mod writer;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// Every critical section in this module leaves its data consistent at each
/// step, so a poisoned lock is still safe to use.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

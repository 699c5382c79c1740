//! Correlation of server-initiated input prompts with client replies.
//!
//! A dispatched command may need a value from its own client mid-operation,
//! the way a terminal command prompts on stdin. The dispatcher holds a
//! [`ConnectionHandle`] capability; calling [`ConnectionHandle::prompt`]
//! emits an `input_request` frame and suspends on a oneshot completion
//! handle keyed by a server-unique request id. When the client answers with
//! `input_response`, the message handler resolves the handle and the
//! suspended command resumes.
//!
//! At most one prompt may be pending per connection; a second concurrent
//! prompt is rejected without emitting a frame. Disconnect resolves a
//! pending prompt as cancelled, and an optional per-prompt timeout resolves
//! it as timed out. Replies with unknown ids are logged and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::{ConnState, Connection, ConnectionId, SendOutcome};
use crate::protocol::{events, server_frame};

/// Why a prompt did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PromptError {
    /// This connection already has a prompt in flight; no frame was sent.
    #[error("a prompt is already pending for this connection")]
    AlreadyPending,
    /// The connection closed (or the server shut down) before the reply.
    #[error("prompt cancelled before a reply arrived")]
    Cancelled,
    /// The per-prompt deadline elapsed.
    #[error("prompt timed out")]
    Timeout,
}

enum Resolution {
    Answered(Value),
    Cancelled,
}

struct PendingPrompt {
    id: String,
    tx: oneshot::Sender<Resolution>,
}

/// Table of in-flight prompts, shared by all connections of one bridge.
#[derive(Default)]
pub struct PromptRouter {
    by_conn: DashMap<ConnectionId, PendingPrompt>,
    by_id: DashMap<String, ConnectionId>,
    next_id: AtomicU64,
}

impl PromptRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new prompt for `conn`, enforcing the one-pending rule.
    fn begin(
        &self,
        conn: ConnectionId,
    ) -> Result<(String, oneshot::Receiver<Resolution>), PromptError> {
        match self.by_conn.entry(conn) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PromptError::AlreadyPending),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let id = format!("p{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingPrompt { id: id.clone(), tx });
                self.by_id.insert(id.clone(), conn);
                Ok((id, rx))
            }
        }
    }

    /// Routes an `input_response` to its waiting prompt. Returns `false` for
    /// unknown ids, which the caller drops after logging.
    pub fn resolve(&self, id: &str, value: Value) -> bool {
        let Some((_, conn)) = self.by_id.remove(id) else {
            return false;
        };
        if let Some((_, pending)) = self.by_conn.remove(&conn) {
            let _ = pending.tx.send(Resolution::Answered(value));
            true
        } else {
            false
        }
    }

    /// Cancels the pending prompt of a closing connection, waking the
    /// suspended dispatcher with a cancelled result.
    pub fn cancel_connection(&self, conn: ConnectionId) {
        if let Some((_, pending)) = self.by_conn.remove(&conn) {
            debug!(conn, prompt = %pending.id, "cancelling pending prompt");
            self.by_id.remove(&pending.id);
            let _ = pending.tx.send(Resolution::Cancelled);
        }
    }

    /// Removes a prompt the waiter abandoned (send failure or timeout).
    fn abort(&self, conn: ConnectionId, id: &str) {
        self.by_conn.remove_if(&conn, |_, pending| pending.id == id);
        self.by_id.remove(id);
    }

    /// Whether `conn` currently has a prompt in flight.
    pub fn has_pending(&self, conn: ConnectionId) -> bool {
        self.by_conn.contains_key(&conn)
    }

    pub fn pending_count(&self) -> usize {
        self.by_conn.len()
    }
}

/// Narrow capability handed to the dispatcher for one connection.
///
/// It exposes exactly what a backend command may do with the client that
/// invoked it: learn its identity and prompt it for input. The full
/// connection object never crosses the seam.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn: Arc<Connection>,
    router: Arc<PromptRouter>,
}

impl ConnectionHandle {
    pub fn new(conn: Arc<Connection>, router: Arc<PromptRouter>) -> Self {
        Self { conn, router }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id
    }

    /// Sends an `input_request` to the client and suspends until the reply,
    /// cancellation, or the optional deadline.
    pub async fn prompt(
        &self,
        descriptor: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, PromptError> {
        let (id, rx) = self.router.begin(self.conn.id)?;

        let frame = server_frame(events::INPUT_REQUEST, Some(id.clone()), descriptor);
        if self.conn.outbox.send_text(frame) != SendOutcome::Sent {
            self.router.abort(self.conn.id, &id);
            return Err(PromptError::Cancelled);
        }

        self.conn.set_state(ConnState::Prompting);
        let resolution = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(resolution) => resolution,
                Err(_) => {
                    warn!(conn = self.conn.id, prompt = %id, "prompt deadline elapsed");
                    self.router.abort(self.conn.id, &id);
                    self.conn.set_state(ConnState::Active);
                    return Err(PromptError::Timeout);
                }
            },
            None => rx.await,
        };
        self.conn.set_state(ConnState::Active);

        match resolution {
            Ok(Resolution::Answered(value)) => Ok(value),
            Ok(Resolution::Cancelled) | Err(_) => Err(PromptError::Cancelled),
        }
    }
}

//! Per-connection state and the shared clients registry.
//!
//! A [`Connection`] is owned by the bridge server for exactly the lifetime of
//! its socket. Outbound traffic goes through the connection's [`Outbox`], a
//! bounded mailbox drained by a dedicated writer task; sends never block the
//! caller. A full mailbox drops the frame, and two consecutive drops condemn
//! the connection as a slow peer. The [`ClientRegistry`] is the broadcast
//! surface: membership mutates under a write lock, while broadcasts work on
//! a snapshot so no lock is held during I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::AuthInfo;

/// Unique for the lifetime of one bridge server instance.
pub type ConnectionId = u64;

/// Consecutive mailbox drops tolerated before the connection is condemned.
const MAX_CONSECUTIVE_DROPS: u32 = 2;

/// Lifecycle of a connection, tracked for logging and membership checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Authed,
    Active,
    Prompting,
    Closing,
    Closed,
}

/// Result of a non-blocking mailbox send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Enqueued for delivery.
    Sent,
    /// Mailbox full; the frame was dropped and logged.
    Dropped,
    /// Second consecutive drop; the connection has been condemned.
    Overloaded,
    /// The peer is gone and the mailbox is closed.
    Closed,
}

/// Clonable, bounded, non-blocking sender for one connection's outbound
/// frames.
#[derive(Clone)]
pub struct Outbox {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
    consecutive_drops: Arc<AtomicU32>,
    condemned: CancellationToken,
}

impl Outbox {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            tx,
            consecutive_drops: Arc::new(AtomicU32::new(0)),
            condemned: CancellationToken::new(),
        }
    }

    /// Enqueues a message without blocking. On overflow the frame is dropped;
    /// hitting the consecutive-drop limit cancels the condemned token, which
    /// the read loop observes and closes the socket with 1011.
    pub fn send(&self, message: Message) -> SendOutcome {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.consecutive_drops.store(0, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let drops = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(conn = self.id, drops, "mailbox full, dropping outbound frame");
                if drops >= MAX_CONSECUTIVE_DROPS {
                    self.condemned.cancel();
                    SendOutcome::Overloaded
                } else {
                    SendOutcome::Dropped
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Enqueues a text frame.
    pub fn send_text(&self, text: String) -> SendOutcome {
        self.send(Message::text(text))
    }

    /// Token cancelled when the connection is condemned as a slow peer.
    pub fn condemned(&self) -> &CancellationToken {
        &self.condemned
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }
}

/// A live client peer.
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub auth: AuthInfo,
    pub opened_at: Instant,
    pub outbox: Outbox,
    state: Mutex<ConnState>,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, auth: AuthInfo, outbox: Outbox) -> Self {
        Self {
            id,
            addr,
            auth,
            opened_at: Instant::now(),
            outbox,
            state: Mutex::new(ConnState::Accepted),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn set_state(&self, next: ConnState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(conn = self.id, from = ?*state, to = ?next, "connection state");
            *state = next;
        }
    }
}

/// Outcome of one broadcast pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// The set of currently-authenticated connections.
///
/// Clones share the same underlying set. Iteration for broadcast snapshots
/// the membership under the read lock and releases it before any send, so a
/// peer disconnecting mid-broadcast cannot stall or panic the broadcaster.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Connection>) {
        self.inner.write().insert(conn.id, conn);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.write().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Membership snapshot taken under the read lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().values().cloned().collect()
    }

    /// Sends `text` to every connection except `except`. Individual failures
    /// are logged and skipped; they never interrupt delivery to other peers.
    pub fn broadcast_text(&self, text: &str, except: Option<ConnectionId>) -> BroadcastReport {
        let peers = self.snapshot();
        let mut report = BroadcastReport::default();
        for peer in peers {
            if Some(peer.id) == except {
                continue;
            }
            match peer.outbox.send_text(text.to_string()) {
                SendOutcome::Sent => report.delivered += 1,
                outcome => {
                    debug!(conn = peer.id, ?outcome, "broadcast delivery skipped");
                    report.dropped += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn connection(id: ConnectionId, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let outbox = Outbox::new(id, tx);
        (
            Arc::new(Connection::new(id, addr(), AuthInfo::anonymous(), outbox)),
            rx,
        )
    }

    #[tokio::test]
    async fn send_enqueues_and_resets_drop_counter() {
        let (conn, mut rx) = connection(1, 1);
        assert_eq!(conn.outbox.send_text("a".into()), SendOutcome::Sent);
        assert_eq!(conn.outbox.send_text("b".into()), SendOutcome::Dropped);
        // drain, then the counter resets on the next success
        assert_eq!(rx.recv().await.unwrap(), Message::text("a"));
        assert_eq!(conn.outbox.send_text("c".into()), SendOutcome::Sent);
        assert_eq!(conn.outbox.send_text("d".into()), SendOutcome::Dropped);
    }

    #[tokio::test]
    async fn two_consecutive_drops_condemn_the_connection() {
        let (conn, _rx) = connection(1, 1);
        conn.outbox.send_text("fill".into());
        assert_eq!(conn.outbox.send_text("x".into()), SendOutcome::Dropped);
        assert!(!conn.outbox.condemned().is_cancelled());
        assert_eq!(conn.outbox.send_text("y".into()), SendOutcome::Overloaded);
        assert!(conn.outbox.condemned().is_cancelled());
    }

    #[tokio::test]
    async fn closed_mailbox_reports_closed() {
        let (conn, rx) = connection(1, 1);
        drop(rx);
        assert_eq!(conn.outbox.send_text("x".into()), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_survives_dead_peers() {
        let registry = ClientRegistry::new();
        let (a, mut rx_a) = connection(1, 8);
        let (b, rx_b) = connection(2, 8);
        let (c, mut rx_c) = connection(3, 8);
        registry.add(a.clone());
        registry.add(b.clone());
        registry.add(c.clone());
        drop(rx_b); // peer b is gone but not yet removed

        let report = registry.broadcast_text("hello", Some(1));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);

        assert_eq!(rx_c.recv().await.unwrap(), Message::text("hello"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn registry_membership() {
        let registry = ClientRegistry::new();
        let (a, _rx) = connection(7, 1);
        registry.add(a.clone());
        assert!(registry.contains(7));
        assert_eq!(registry.len(), 1);
        let removed = registry.remove(7).unwrap();
        assert_eq!(removed.id, 7);
        assert!(registry.is_empty());
        assert!(registry.remove(7).is_none());
    }

    #[test]
    fn state_transitions_are_recorded() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(1, addr(), AuthInfo::anonymous(), Outbox::new(1, tx));
        assert_eq!(conn.state(), ConnState::Accepted);
        conn.set_state(ConnState::Authed);
        conn.set_state(ConnState::Active);
        assert_eq!(conn.state(), ConnState::Active);
    }
}

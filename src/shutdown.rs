//! Graceful shutdown plumbing shared by the bridge and the static server.
//!
//! One [`ShutdownController`] per server. Tasks that must exit cleanly hold a
//! [`Shutdown`] guard: the broadcast half tells them the server is going
//! away, and the guard's completion sender, dropped when the task ends, is
//! how the controller knows every task has drained. The trigger is
//! idempotent and bounded by a deadline; a second call returns immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Owner side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownController {
    notify: broadcast::Sender<()>,
    fired: AtomicBool,
    complete_tx: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
    complete_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        Self {
            notify,
            fired: AtomicBool::new(false),
            complete_tx: parking_lot::Mutex::new(Some(complete_tx)),
            complete_rx: tokio::sync::Mutex::new(complete_rx),
        }
    }

    /// Creates a guard for a task that participates in graceful shutdown.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            notified: self.is_shutdown(),
            rx: self.notify.subscribe(),
            _complete: self.complete_tx.lock().clone(),
        }
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Triggers shutdown and waits for all guards to drop, bounded by
    /// `deadline`. Returns `true` when every task drained in time. Calling
    /// again after the first trigger returns `true` immediately.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return true;
        }
        debug!("shutdown triggered");
        let _ = self.notify.send(());
        // Drop our completion sender so the channel closes once all guards do.
        *self.complete_tx.lock() = None;

        let mut complete_rx = self.complete_rx.lock().await;
        match tokio::time::timeout(deadline, complete_rx.recv()).await {
            Ok(_) => true,
            Err(_) => {
                warn!(?deadline, "shutdown deadline elapsed with tasks still running");
                false
            }
        }
    }
}

/// Per-task shutdown guard.
pub struct Shutdown {
    notified: bool,
    rx: broadcast::Receiver<()>,
    _complete: Option<mpsc::Sender<()>>,
}

impl Shutdown {
    /// Whether this guard has already observed the signal.
    pub fn is_shutdown(&self) -> bool {
        self.notified
    }

    /// Suspends until the shutdown signal arrives. Returns immediately if it
    /// was already observed.
    pub async fn recv(&mut self) {
        if self.notified {
            return;
        }
        let _ = self.rx.recv().await;
        self.notified = true;
    }
}

//! Process-wide shutdown signalling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Cloneable shutdown handle: an atomic flag checked in loop conditions
/// plus a broadcast channel for tasks parked in `select!`.
#[derive(Clone)]
pub struct ShutdownToken {
    done: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            done: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    /// Flag shutdown and wake all subscribers.
    pub fn trigger(&self) {
        self.done.store(true, Ordering::SeqCst);
        let _ = self.notify.send(());
    }

    /// Check the shutdown flag.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Subscribe for a wakeup when shutdown is triggered.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

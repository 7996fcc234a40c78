//! A live listener: one WebSocket connection's subscription to a session's
//! broadcast stream.

use crate::history::HistoryEntry;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Bounded outbound queue depth per listener. Once a listener's queue is
/// full, it is evicted rather than slowing the broadcaster.
pub const LISTENER_QUEUE_CAPACITY: usize = 512;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying one attached listener within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The broadcaster-side handle to a listener's outbound queue.
pub struct Listener {
    pub id: ListenerId,
    sender: mpsc::Sender<HistoryEntry>,
}

/// The consumer-side handle returned to whoever registers the listener (the
/// WebSocket connection's outbound pump task).
pub struct ListenerHandle {
    pub id: ListenerId,
    pub receiver: mpsc::Receiver<HistoryEntry>,
}

/// Create a new listener with a fresh id and a bounded channel.
#[must_use]
pub fn new_listener() -> (Listener, ListenerHandle) {
    let id = ListenerId::next();
    let (tx, rx) = mpsc::channel(LISTENER_QUEUE_CAPACITY);
    (
        Listener { id, sender: tx },
        ListenerHandle { id, receiver: rx },
    )
}

impl Listener {
    /// Attempt to push a frame without blocking. Returns `Err` if the
    /// listener's queue is full (caller should evict) or the receiver has
    /// gone away (caller should remove silently).
    pub fn try_push(&self, entry: HistoryEntry) -> Result<(), PushError> {
        match self.sender.try_send(entry) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The listener's bounded queue is full; evict it.
    Backpressure,
    /// The listener's receiver has already been dropped.
    Closed,
}

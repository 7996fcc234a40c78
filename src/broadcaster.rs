//! Fans PTY ingress bytes out to the History Store and every attached
//! listener.
//!
//! The broadcaster never blocks the PTY read loop: listener pushes are
//! non-blocking (`try_send`), and a listener that can't keep up is evicted
//! rather than allowed to slow everyone else down.

use crate::history::{HistoryEntry, HistoryStore, SourceTag};
use crate::listener::{Listener, ListenerHandle, ListenerId, PushError};

/// Owns one session's History Store and its set of live listeners.
pub struct OutputBroadcaster {
    history: HistoryStore,
    listeners: Vec<Listener>,
}

impl OutputBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: HistoryStore::new(),
            listeners: Vec::new(),
        }
    }

    /// Stamp, store, and fan out one chunk of output.
    ///
    /// Returns the stamped `HistoryEntry` so the caller (the session's
    /// ingress loop) can also hand it to the Command Dispatcher for
    /// completion detection and per-command stdout accumulation.
    pub fn broadcast(&mut self, data: Vec<u8>, source: SourceTag) -> HistoryEntry {
        let entry = self.history.append(data, source);
        self.fan_out(&entry);
        entry
    }

    fn fan_out(&mut self, entry: &HistoryEntry) {
        let mut evict = Vec::new();
        for listener in &self.listeners {
            match listener.try_push(entry.clone()) {
                Ok(()) => {}
                Err(PushError::Backpressure) => {
                    tracing::warn!(listener = ?listener.id, "listener backpressure exceeded, evicting");
                    evict.push(listener.id);
                }
                Err(PushError::Closed) => evict.push(listener.id),
            }
        }
        if !evict.is_empty() {
            self.listeners.retain(|l| !evict.contains(&l.id));
        }
    }

    /// Register a new listener and return a handle for history replay plus
    /// live delivery. Replay and live delivery share the same queue: the
    /// caller must snapshot history and enqueue it into the returned
    /// handle's channel *before* this listener starts receiving live frames,
    /// which is why `attach` returns the snapshot synchronously alongside
    /// the handle — no live frame can be fanned out in between because the
    /// caller holds the session lock across both steps.
    pub fn attach(&mut self) -> (Vec<HistoryEntry>, ListenerHandle) {
        let (listener, handle) = crate::listener::new_listener();
        let snapshot = self.history.snapshot();
        self.listeners.push(listener);
        (snapshot, handle)
    }

    pub fn detach(&mut self, id: ListenerId) {
        self.listeners.retain(|l| l.id != id);
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn history_snapshot(&self) -> Vec<HistoryEntry> {
        self.history.snapshot()
    }
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

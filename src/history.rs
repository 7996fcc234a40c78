//! Per-session bounded history ring.
//!
//! Raw output bytes are preserved verbatim — CRLF is never normalized to LF,
//! and control bytes are never stripped. Capacity is a byte budget (256 KiB),
//! not an entry count; on overflow, whole entries are evicted oldest-first,
//! but sequence numbers are never reused or reassigned.

use serde::Serialize;
use std::collections::VecDeque;

/// Byte capacity of a session's history ring.
pub const HISTORY_CAPACITY_BYTES: usize = 256 * 1024;

/// Classification of a history entry's origin, preserved for the browser so
/// the terminal UI can style echoes differently from raw command output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    System,
    UserCommandEcho,
    ClaudeCommandEcho,
    CommandOutput,
    Prompt,
}

/// One chunk of output, stamped with a session-monotonic sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub sequence: u64,
    pub data: Vec<u8>,
    pub source: SourceTag,
}

impl HistoryEntry {
    fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Append-only ring buffer of history entries, bounded by total byte size.
///
/// Writes are append-only under the session's shared lock; reads for replay
/// take a snapshot `Vec<HistoryEntry>` and never block writers.
pub struct HistoryStore {
    entries: VecDeque<HistoryEntry>,
    total_bytes: usize,
    capacity_bytes: usize,
    next_sequence: u64,
}

impl HistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY_BYTES)
    }

    #[must_use]
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
            capacity_bytes,
            next_sequence: 0,
        }
    }

    /// Append a chunk of output, assigning it the next sequence number.
    /// Returns the entry that was appended (cheap clone of the sequence +
    /// source; the byte data is moved in).
    pub fn append(&mut self, data: Vec<u8>, source: SourceTag) -> HistoryEntry {
        let entry = HistoryEntry {
            sequence: self.next_sequence,
            data,
            source,
        };
        self.next_sequence += 1;
        self.total_bytes += entry.byte_len();
        self.entries.push_back(entry.clone());
        self.evict_overflow();
        entry
    }

    fn evict_overflow(&mut self) {
        while self.total_bytes > self.capacity_bytes {
            match self.entries.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.byte_len(),
                None => break,
            }
        }
    }

    /// A snapshot of every currently-retained entry, in sequence order — the
    /// basis for history replay to a newly attached listener.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Sequence number that will be assigned to the next appended entry.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

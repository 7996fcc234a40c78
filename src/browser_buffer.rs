//! Per-session bounded ring of browser-initiated command results.
//!
//! Surfaced verbatim in the `BROWSER_COMMANDS_EXECUTED` gating payload and
//! wiped on session teardown.

use serde::Serialize;
use std::collections::VecDeque;

/// FIFO eviction cap.
pub const BROWSER_BUFFER_CAPACITY: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCommandRecord {
    #[serde(rename = "command")]
    pub command_string: String,
    pub command_id: String,
    /// Milliseconds since the Unix epoch, stamped by the caller so the
    /// buffer itself never touches the wall clock.
    pub timestamp_ms: u64,
    pub source: &'static str,
    pub result: CommandOutcome,
}

/// FIFO ring of resolved browser commands, capped at 500 entries.
pub struct BrowserCommandBuffer {
    entries: VecDeque<BrowserCommandRecord>,
}

impl BrowserCommandBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a resolved browser command, evicting the oldest entry if the
    /// buffer is at capacity.
    pub fn push(&mut self, mut record: BrowserCommandRecord) {
        record.source = "user";
        if self.entries.len() >= BROWSER_BUFFER_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<BrowserCommandRecord> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for BrowserCommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

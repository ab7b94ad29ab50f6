//! The authoritative ordered record of the conversation.
//!
//! Append-only: entries are never mutated after write, and the sequence
//! number is the global order every subscriber observes. The scheduler
//! is the single writer; readers hold restartable cursors over a shared
//! view.
//!
//! ## Record schema
//!
//! ```json
//! {
//!   "sequence": 12,
//!   "wall_time": "2026-08-02T04:16:56.465Z",
//!   "agent": "Arc",
//!   "kind": "turn",
//!   "payload": "starting cooldown cycle",
//!   "causal_prev": 11
//! }
//! ```

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// The kinds of committed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Turn,
    Interrupt,
    Handoff,
    Complete,
    Error,
    Ballot,
    Vote,
}

/// One committed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub sequence: u64,
    pub wall_time: DateTime<Utc>,
    pub agent: String,
    pub kind: EventKind,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causal_prev: Option<u64>,
}

/// Append-only log with a single writer and any number of cursors.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Arc<RwLock<Vec<TranscriptEntry>>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit an entry, assigning the next sequence number. Returns it.
    pub fn append(&self, agent: &str, kind: EventKind, payload: impl Into<String>) -> u64 {
        let mut entries = self.entries.write();
        let sequence = entries.len() as u64;
        let causal_prev = sequence.checked_sub(1);
        entries.push(TranscriptEntry {
            sequence,
            wall_time: Utc::now(),
            agent: agent.to_string(),
            kind,
            payload: payload.into(),
            causal_prev,
        });
        sequence
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// A restartable view starting at the beginning.
    pub fn cursor(&self) -> TranscriptCursor {
        TranscriptCursor {
            entries: Arc::clone(&self.entries),
            pos: 0,
        }
    }

    /// Snapshot of everything committed so far.
    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.read().clone()
    }

    /// Only the entries of one kind (e.g. committed turns).
    pub fn of_kind(&self, kind: EventKind) -> Vec<TranscriptEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Dump the whole log as pretty JSON, for post-run audit.
    pub fn export_json(&self, path: &Path) -> anyhow::Result<()> {
        let entries = self.entries.read();
        let json = serde_json::to_string_pretty(&*entries)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), entries = entries.len(), "transcript exported");
        Ok(())
    }
}

/// A restartable reader over the transcript. Multiple cursors can read
/// concurrently with the writer; each sees the committed prefix.
#[derive(Debug)]
pub struct TranscriptCursor {
    entries: Arc<RwLock<Vec<TranscriptEntry>>>,
    pos: usize,
}

impl TranscriptCursor {
    /// The next committed entry, or `None` if the cursor has caught up.
    pub fn next(&mut self) -> Option<TranscriptEntry> {
        let entries = self.entries.read();
        let entry = entries.get(self.pos)?.clone();
        self.pos += 1;
        Some(entry)
    }

    /// Rewind to the beginning.
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

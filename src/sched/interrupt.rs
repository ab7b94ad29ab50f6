//! Pending pre-emption requests, highest effective priority first.
//!
//! Effective priority is `raw * (0.5 + reputation/2)`, computed once at
//! push time against the current ledger. Ties break by earliest arrival,
//! then by arrival sequence, so equal-priority requests cannot starve.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One pending pre-emption request.
#[derive(Debug, Clone)]
pub struct InterruptEntry {
    pub agent: String,
    pub raw_priority: u8,
    pub effective_priority: f64,
    pub payload: String,
    pub arrived_at: DateTime<Utc>,
    /// Monotonic arrival counter, the final tie-breaker
    pub arrival_seq: u64,
}

impl PartialEq for InterruptEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for InterruptEntry {}

impl PartialOrd for InterruptEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InterruptEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on effective priority; min on arrival for equal priority.
        self.effective_priority
            .total_cmp(&other.effective_priority)
            .then_with(|| other.arrived_at.cmp(&self.arrived_at))
            .then_with(|| other.arrival_seq.cmp(&self.arrival_seq))
    }
}

/// Compute the reputation-scaled priority used for heap ordering.
pub fn effective_priority(raw_priority: u8, reputation: f64) -> f64 {
    f64::from(raw_priority) * (0.5 + reputation / 2.0)
}

#[derive(Debug, Default)]
pub struct InterruptHeap {
    heap: BinaryHeap<InterruptEntry>,
    next_seq: u64,
}

impl InterruptHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request, scaling its priority by the agent's current
    /// reputation. Returns the stored entry for logging.
    pub fn push(&mut self, agent: &str, raw_priority: u8, reputation: f64, payload: &str) -> InterruptEntry {
        let entry = InterruptEntry {
            agent: agent.to_string(),
            raw_priority: raw_priority.min(100),
            effective_priority: effective_priority(raw_priority.min(100), reputation),
            payload: payload.to_string(),
            arrived_at: Utc::now(),
            arrival_seq: self.next_seq,
        };
        self.next_seq += 1;
        self.heap.push(entry.clone());
        entry
    }

    pub fn peek(&self) -> Option<&InterruptEntry> {
        self.heap.peek()
    }

    pub fn pop(&mut self) -> Option<InterruptEntry> {
        self.heap.pop()
    }

    /// Remove every pending request from one agent (used on demotion).
    /// Returns the removed entries.
    pub fn drain_for(&mut self, agent: &str) -> Vec<InterruptEntry> {
        let mut kept = BinaryHeap::with_capacity(self.heap.len());
        let mut removed = Vec::new();
        for entry in self.heap.drain() {
            if entry.agent == agent {
                removed.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.heap = kept;
        removed
    }

    /// Remove and return everything (used when flushing on COMPLETE).
    pub fn drain_all(&mut self) -> Vec<InterruptEntry> {
        let mut out: Vec<_> = self.heap.drain().collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

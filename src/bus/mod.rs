//! In-process pub/sub bus for scheduler and agent traffic.
//!
//! A broadcast-based bus that every participant (the scheduler, agent
//! backends, the console dispatcher, the beat executor) plugs into.
//! Subscribers receive every envelope and filter by topic on their side.
//!
//! # Topic scheme
//!
//! | Topic | Semantics |
//! |-------|-----------|
//! | `global` | The shared conversational channel; committed turns, ballots, errors |
//! | `agent.{handle}` | Private messages *to* a specific agent |
//! | `bus.overflow` | Telemetry: a subscriber lagged and dropped messages |
//!
//! Publication is non-blocking and never fails visibly. Per topic, per
//! subscriber, delivery is FIFO; there is no cross-topic ordering
//! guarantee. A slow subscriber loses the *oldest* buffered envelopes,
//! and the loss is reported both as a `tracing` warning and as an
//! [`BusMessage::Overflow`] event on `bus.overflow`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

/// The single shared conversational topic.
pub const GLOBAL_TOPIC: &str = "global";

/// Topic carrying subscriber-overflow telemetry.
pub const OVERFLOW_TOPIC: &str = "bus.overflow";

/// Private topic for a specific agent.
pub fn agent_topic(handle: &str) -> String {
    format!("agent.{handle}")
}

/// Default per-bus buffer capacity.
const DEFAULT_BUS_CAPACITY: usize = 4096;

// ─── Envelope & messages ─────────────────────────────────────────────────

/// Metadata wrapper for every message that travels through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id for this envelope
    pub id: String,
    /// Routing topic (`global`, `agent.{handle}`, ...)
    pub topic: String,
    /// Handle of the participant that published this envelope
    pub sender: String,
    /// Publication wall time
    pub timestamp: DateTime<Utc>,
    /// Bus-wide publication sequence (per-topic FIFO follows from it)
    pub seq: u64,
    /// The payload
    pub message: BusMessage,
}

/// Vote choice on an open proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Approve,
    Reject,
}

/// The set of messages the bus can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusMessage {
    /// A committed turn on the shared channel
    Turn { agent: String, text: String },
    /// A pending pre-emption request was accepted onto the heap
    Interrupt {
        agent: String,
        priority: u8,
        payload: String,
    },
    /// Voluntary transfer of the next turn
    Handoff {
        from: String,
        to: String,
        payload: String,
    },
    /// An agent signalled the conversation is finished
    Complete { agent: String },
    /// A recoverable failure surfaced to subscribers
    Error { agent: String, detail: String },
    /// A proposal was opened for voting
    Ballot {
        proposal_id: Uuid,
        proposal_type: String,
        content: String,
        proposer: String,
    },
    /// A vote was recorded on an open proposal
    Vote {
        proposal_id: Uuid,
        agent: String,
        choice: VoteChoice,
    },
    /// A proposal reached a terminal state
    BallotResult { proposal_id: Uuid, status: String },
    /// Private message routed to one agent
    Direct {
        from: String,
        to: String,
        text: String,
    },
    /// Beat executor fired a tick
    Tick { beat: i64 },
    /// A tuning knob changed at runtime
    ConfigChanged { key: String, value: String },
    /// Outcome of a console command
    CommandOutcome { command: String, detail: String },
    /// A subscriber lagged; the oldest `dropped` envelopes were discarded
    Overflow { subscriber: String, dropped: u64 },
}

// ─── Bus ─────────────────────────────────────────────────────────────────

/// The central in-process message bus.
///
/// Internally a `tokio::sync::broadcast` channel: every subscriber sees
/// every envelope, topic filtering happens in [`BusHandle`]. Topics have
/// no registration step; an unknown topic exists as soon as something is
/// published on it.
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    seq: AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Create a handle scoped to one subscriber.
    pub fn handle(self: &Arc<Self>, subscriber: impl Into<String>) -> BusHandle {
        BusHandle {
            subscriber: subscriber.into(),
            bus: Arc::clone(self),
            rx: self.tx.subscribe(),
        }
    }

    /// Publish a message on a topic. Non-blocking; if nobody is listening
    /// the envelope is silently dropped. Returns the receiver count.
    pub fn publish(&self, topic: impl Into<String>, sender: &str, message: BusMessage) -> usize {
        let envelope = Envelope {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            sender: sender.to_string(),
            timestamp: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            message,
        };
        self.tx.send(envelope).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── BusHandle ───────────────────────────────────────────────────────────

/// A scoped handle one subscriber uses to send and receive envelopes.
///
/// Dropping the handle unsubscribes.
pub struct BusHandle {
    subscriber: String,
    bus: Arc<Bus>,
    rx: broadcast::Receiver<Envelope>,
}

impl BusHandle {
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// Publish on behalf of this subscriber.
    pub fn send(&self, topic: impl Into<String>, message: BusMessage) -> usize {
        self.bus.publish(topic, &self.subscriber, message)
    }

    /// Receive the next envelope on any topic. Returns `None` once the
    /// bus shuts down. Lag is absorbed here: the oldest envelopes are
    /// already gone, so we report the loss and keep reading.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(env) => return Some(env),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.report_overflow(n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive the next envelope whose topic matches exactly.
    pub async fn recv_topic(&mut self, topic: &str) -> Option<Envelope> {
        loop {
            match self.recv().await {
                Some(env) if env.topic == topic => return Some(env),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Receive the next envelope addressed privately to this subscriber.
    pub async fn recv_mine(&mut self) -> Option<Envelope> {
        let topic = agent_topic(&self.subscriber);
        self.recv_topic(&topic).await
    }

    /// Try to receive without blocking.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(env) => return Some(env),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.report_overflow(n);
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered for a given topic.
    pub fn drain_topic(&mut self, topic: &str) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(env) = self.try_recv() {
            if env.topic == topic {
                out.push(env);
            }
        }
        out
    }

    fn report_overflow(&self, dropped: u64) {
        tracing::warn!(
            subscriber = %self.subscriber,
            dropped,
            "bus subscriber lagged, oldest messages dropped"
        );
        self.bus.publish(
            OVERFLOW_TOPIC,
            &self.subscriber,
            BusMessage::Overflow {
                subscriber: self.subscriber.clone(),
                dropped,
            },
        );
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

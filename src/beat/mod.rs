//! Beat-based deterministic executor.
//!
//! An alternative, tick-driven front end: work is scheduled at a
//! (beat, slot) coordinate and executed in strict order. Beats are
//! monotonic integer ticks of a fixed duration; slots are small
//! integers with fixed semantics (housekeeping, routing, actions,
//! logging, ping-window). Within a beat, entries run in ascending slot
//! order, insertion order within a slot; across beats, in ascending
//! beat order. A beat fires exactly once and is never skipped — under
//! load it runs late, never out of order.
//!
//! Entries either invoke a registered agent callback synchronously or
//! enqueue an interrupt into the turn scheduler, letting the priority
//! model apply inside a deterministic outer envelope.

pub mod timeline;

use crate::bus::{Bus, BusMessage, GLOBAL_TOPIC};
use crate::sched::SchedulerHandle;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A monotonic integer tick.
pub type Beat = i64;

/// An execution window within a beat.
pub type Slot = u8;

/// What a scheduled entry does when its beat fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BeatPayload {
    /// Invoke the agent's registered callback with an action
    Invoke {
        action: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Push an interrupt for the agent onto the scheduler's heap
    Interrupt { priority: u8, text: String },
}

impl BeatPayload {
    /// Short label for timeline summaries.
    pub fn action(&self) -> &str {
        match self {
            BeatPayload::Invoke { action, .. } => action,
            BeatPayload::Interrupt { .. } => "interrupt",
        }
    }
}

/// One scheduled entry on the timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatEvent {
    pub beat: Beat,
    pub slot: Slot,
    pub agent: String,
    pub payload: BeatPayload,
    pub scheduled_at: DateTime<Utc>,
}

/// Callback invoked synchronously when an `Invoke` entry fires.
pub type BeatCallback = Box<dyn FnMut(&BeatEvent) -> Result<()> + Send>;

struct Timeline {
    entries: BTreeMap<Beat, Vec<BeatEvent>>,
    slots: BTreeMap<Slot, String>,
    current_beat: Beat,
}

/// The tick-driven executor.
///
/// Callbacks live behind their own lock so a callback may call
/// [`BeatExecutor::schedule`] for a future beat without deadlocking.
pub struct BeatExecutor {
    duration: Duration,
    origin: DateTime<Utc>,
    timeline: Arc<Mutex<Timeline>>,
    callbacks: Arc<Mutex<HashMap<String, BeatCallback>>>,
    bus: Option<Arc<Bus>>,
    scheduler: Option<SchedulerHandle>,
    stop: Option<watch::Sender<bool>>,
}

impl BeatExecutor {
    pub fn new(duration: Duration) -> Self {
        Self::with_origin(duration, Utc::now())
    }

    /// Fix the wall-clock origin of beat 0, for replay and tests.
    pub fn with_origin(duration: Duration, origin: DateTime<Utc>) -> Self {
        Self {
            duration,
            origin,
            timeline: Arc::new(Mutex::new(Timeline {
                entries: BTreeMap::new(),
                slots: BTreeMap::new(),
                current_beat: 0,
            })),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            bus: None,
            scheduler: None,
            stop: None,
        }
    }

    /// Publish a TICK event on the bus after every fired beat.
    pub fn connect_bus(mut self, bus: Arc<Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Route `Interrupt` entries into the turn scheduler.
    pub fn connect_scheduler(mut self, handle: SchedulerHandle) -> Self {
        self.scheduler = Some(handle);
        self
    }

    /// Assign a name to a slot index.
    pub fn register_slot(&self, slot: Slot, name: impl Into<String>) {
        self.timeline.lock().slots.insert(slot, name.into());
    }

    pub fn slot_name(&self, slot: Slot) -> Option<String> {
        self.timeline.lock().slots.get(&slot).cloned()
    }

    /// Register the callback fired for an agent's `Invoke` entries.
    pub fn register_agent(&self, agent: impl Into<String>, callback: BeatCallback) {
        self.callbacks.lock().insert(agent.into(), callback);
    }

    /// Insert an entry into the timeline. Past beats are accepted; they
    /// fire on the next pass if the executor has not reached them yet,
    /// and are queryable either way.
    pub fn schedule(
        &self,
        beat: Beat,
        slot: Slot,
        agent: impl Into<String>,
        payload: BeatPayload,
    ) -> BeatEvent {
        let event = BeatEvent {
            beat,
            slot,
            agent: agent.into(),
            payload,
            scheduled_at: Utc::now(),
        };
        self.timeline
            .lock()
            .entries
            .entry(beat)
            .or_default()
            .push(event.clone());
        tracing::debug!(beat, slot, agent = %event.agent, "beat event scheduled");
        event
    }

    /// All entries for a beat, in execution order (ascending slot,
    /// insertion order within a slot).
    pub fn fetch(&self, beat: Beat) -> Vec<BeatEvent> {
        let timeline = self.timeline.lock();
        let mut events = timeline.entries.get(&beat).cloned().unwrap_or_default();
        // Stable sort keeps insertion order within a slot.
        events.sort_by_key(|e| e.slot);
        events
    }

    pub fn current_beat(&self) -> Beat {
        self.timeline.lock().current_beat
    }

    pub fn beat_duration(&self) -> Duration {
        self.duration
    }

    /// Which beat contains the given wall time?
    pub fn time_to_beat(&self, t: DateTime<Utc>) -> Beat {
        let elapsed_ms = (t - self.origin).num_milliseconds();
        elapsed_ms.div_euclid(self.duration.as_millis() as i64)
    }

    /// Wall time at which a beat begins.
    pub fn beat_to_time(&self, beat: Beat) -> DateTime<Utc> {
        self.origin + ChronoDuration::milliseconds(beat * self.duration.as_millis() as i64)
    }

    /// Begin emitting ticks. Each tick processes exactly one beat, in
    /// order; if the machine stalls, ticks burst to catch up rather
    /// than skip.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop = Some(stop_tx);

        let duration = self.duration;
        let timeline = Arc::clone(&self.timeline);
        let callbacks = Arc::clone(&self.callbacks);
        let bus = self.bus.clone();
        let scheduler = self.scheduler.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + duration;
            let mut ticker = tokio::time::interval_at(start, duration);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
            let mut next_beat: Beat = 0;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let beat = next_beat;
                next_beat += 1;
                process_beat(&timeline, &callbacks, beat, scheduler.as_ref());
                timeline.lock().current_beat = next_beat;

                if let Some(bus) = &bus {
                    bus.publish(GLOBAL_TOPIC, "beats", BusMessage::Tick { beat });
                }
            }
            tracing::info!(last_beat = next_beat.saturating_sub(1), "beat executor stopped");
        })
    }

    /// Halt the tick loop. Already-fired beats stay queryable.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }

    /// Fire one beat synchronously without the tick loop. Used for
    /// offline replay; respects the same ordering rules.
    pub fn fire(&self, beat: Beat) {
        process_beat(&self.timeline, &self.callbacks, beat, self.scheduler.as_ref());
        let mut timeline = self.timeline.lock();
        if timeline.current_beat <= beat {
            timeline.current_beat = beat + 1;
        }
    }
}

/// Run one beat: entries in ascending slot order, insertion order
/// within a slot, callbacks invoked synchronously.
fn process_beat(
    timeline: &Arc<Mutex<Timeline>>,
    callbacks: &Arc<Mutex<HashMap<String, BeatCallback>>>,
    beat: Beat,
    scheduler: Option<&SchedulerHandle>,
) {
    // Copy the entries out so the timeline lock is free while
    // callbacks run (a callback may schedule future beats).
    let mut events = {
        let timeline = timeline.lock();
        timeline.entries.get(&beat).cloned().unwrap_or_default()
    };
    if events.is_empty() {
        return;
    }
    events.sort_by_key(|e| e.slot);

    for event in &events {
        match &event.payload {
            BeatPayload::Invoke { .. } => {
                let mut callbacks = callbacks.lock();
                match callbacks.get_mut(&event.agent) {
                    Some(callback) => {
                        if let Err(err) = callback(event) {
                            tracing::error!(
                                beat,
                                slot = event.slot,
                                agent = %event.agent,
                                error = %err,
                                "beat callback failed"
                            );
                        }
                    }
                    None => {
                        tracing::warn!(
                            beat,
                            agent = %event.agent,
                            "no callback registered for beat entry"
                        );
                    }
                }
            }
            BeatPayload::Interrupt { priority, text } => match scheduler {
                Some(handle) => handle.request_interrupt(&event.agent, *priority, text),
                None => {
                    tracing::warn!(beat, agent = %event.agent, "no scheduler connected for beat interrupt");
                }
            },
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

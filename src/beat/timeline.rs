//! Readable views over the beat timeline.

use super::{Beat, BeatExecutor, Slot};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Summary of one scheduled entry, resolved against slot names.
#[derive(Debug, Clone)]
pub struct EventSummary {
    pub beat: Beat,
    pub slot: Slot,
    pub slot_name: String,
    pub agent: String,
    pub action: String,
    pub scheduled_at: DateTime<Utc>,
}

/// A read-only viewer over an executor's timeline.
pub struct TimelineView<'a> {
    executor: &'a BeatExecutor,
}

impl<'a> TimelineView<'a> {
    pub fn new(executor: &'a BeatExecutor) -> Self {
        Self { executor }
    }

    /// Entries at one beat, in execution order.
    pub fn events_at(&self, beat: Beat) -> Vec<EventSummary> {
        self.executor
            .fetch(beat)
            .into_iter()
            .map(|event| EventSummary {
                beat: event.beat,
                slot: event.slot,
                slot_name: self
                    .executor
                    .slot_name(event.slot)
                    .unwrap_or_else(|| format!("slot {}", event.slot)),
                agent: event.agent,
                action: event.payload.action().to_string(),
                scheduled_at: event.scheduled_at,
            })
            .collect()
    }

    /// Non-empty beats within a wall-clock range, keyed by beat.
    pub fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BTreeMap<Beat, Vec<EventSummary>> {
        let mut out = BTreeMap::new();
        let first = self.executor.time_to_beat(start);
        let last = self.executor.time_to_beat(end);
        for beat in first..=last {
            let events = self.events_at(beat);
            if !events.is_empty() {
                out.insert(beat, events);
            }
        }
        out
    }

    /// Human-readable rendering of one beat.
    pub fn format_beat(&self, beat: Beat) -> String {
        let events = self.events_at(beat);
        if events.is_empty() {
            return format!("No events at beat {beat}\n");
        }

        let mut out = String::new();
        let when = self
            .executor
            .beat_to_time(beat)
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let _ = writeln!(out, "Events at beat {beat} (time: {when}):");
        for event in events {
            let _ = writeln!(
                out,
                "  [{}] agent: {}, action: {}",
                event.slot_name, event.agent, event.action
            );
        }
        out
    }

    /// Human-readable rendering of every non-empty beat in a range.
    pub fn format_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        let beats = self.events_between(start, end);
        if beats.is_empty() {
            return "No events in the specified time range.\n".to_string();
        }

        let mut out = String::new();
        for (beat, events) in beats {
            let when = self
                .executor
                .beat_to_time(beat)
                .to_rfc3339_opts(SecondsFormat::Secs, true);
            let _ = writeln!(out, "Beat {beat} (time: {when}):");
            for event in events {
                let _ = writeln!(
                    out,
                    "  [{}] agent: {}, action: {}",
                    event.slot_name, event.agent, event.action
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beat::BeatPayload;
    use chrono::TimeZone;
    use std::time::Duration;

    fn executor() -> BeatExecutor {
        let origin = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let executor = BeatExecutor::with_origin(Duration::from_millis(500), origin);
        executor.register_slot(1, "routing");
        executor.register_slot(2, "actions");
        executor.register_slot(3, "logging");
        executor
    }

    #[test]
    fn summaries_resolve_slot_names() {
        let executor = executor();
        executor.schedule(
            5,
            1,
            "Otto",
            BeatPayload::Invoke {
                action: "route".into(),
                args: serde_json::Value::Null,
            },
        );

        let view = TimelineView::new(&executor);
        let events = view.events_at(5);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].slot_name, "routing");
        assert_eq!(events[0].action, "route");

        // Unnamed slots fall back to the index
        executor.schedule(
            5,
            7,
            "Otto",
            BeatPayload::Invoke {
                action: "noop".into(),
                args: serde_json::Value::Null,
            },
        );
        let events = view.events_at(5);
        assert_eq!(events[1].slot_name, "slot 7");
    }

    #[test]
    fn range_view_collects_only_nonempty_beats() {
        let executor = executor();
        executor.schedule(
            2,
            2,
            "Arc",
            BeatPayload::Invoke {
                action: "start".into(),
                args: serde_json::Value::Null,
            },
        );
        executor.schedule(
            4,
            3,
            "Clarity",
            BeatPayload::Invoke {
                action: "log".into(),
                args: serde_json::Value::Null,
            },
        );

        let view = TimelineView::new(&executor);
        let start = executor.beat_to_time(0);
        let end = executor.beat_to_time(5);
        let beats = view.events_between(start, end);
        assert_eq!(beats.keys().copied().collect::<Vec<_>>(), vec![2, 4]);
    }

    #[test]
    fn format_beat_mentions_slots_and_agents() {
        let executor = executor();
        executor.schedule(
            6,
            3,
            "Clarity",
            BeatPayload::Invoke {
                action: "log".into(),
                args: serde_json::Value::Null,
            },
        );
        executor.schedule(
            6,
            2,
            "Arc",
            BeatPayload::Invoke {
                action: "start".into(),
                args: serde_json::Value::Null,
            },
        );

        let view = TimelineView::new(&executor);
        let text = view.format_beat(6);
        let arc_pos = text.find("agent: Arc").unwrap();
        let clarity_pos = text.find("agent: Clarity").unwrap();
        assert!(arc_pos < clarity_pos, "actions render before logging");

        assert_eq!(view.format_beat(99), "No events at beat 99\n");
    }
}

//! Deterministic executor scenarios: slot ordering within a beat,
//! beat-monotonic execution, wall-time conversions, and the bridge
//! from beat-scheduled interrupts into the turn scheduler.

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use roundtable::agent::Agent;
use roundtable::beat::{BeatEvent, BeatExecutor, BeatPayload};
use roundtable::bus::Bus;
use roundtable::config::{QuorumConfig, SchedulerConfig};
use roundtable::sched::{EventKind, Scheduler};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn executor() -> BeatExecutor {
    let origin = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
    let executor = BeatExecutor::with_origin(Duration::from_millis(500), origin);
    executor.register_slot(0, "housekeeping");
    executor.register_slot(1, "routing");
    executor.register_slot(2, "actions");
    executor.register_slot(3, "logging");
    executor.register_slot(4, "ping_window");
    executor
}

fn invoke(action: &str) -> BeatPayload {
    BeatPayload::Invoke {
        action: action.to_string(),
        args: serde_json::Value::Null,
    }
}

/// Scenario F: routing at beat 5, actions before logging at beat 6.
#[test]
fn slot_order_within_a_beat_is_deterministic() {
    let executor = executor();
    let fired: Arc<Mutex<Vec<(i64, u8, String)>>> = Arc::new(Mutex::new(Vec::new()));

    for agent in ["Otto", "Arc", "Clarity"] {
        let fired = Arc::clone(&fired);
        executor.register_agent(
            agent,
            Box::new(move |event: &BeatEvent| {
                fired
                    .lock()
                    .push((event.beat, event.slot, event.agent.clone()));
                Ok(())
            }),
        );
    }

    executor.schedule(5, 1, "Otto", invoke("route @Arc cool"));
    executor.schedule(6, 3, "Clarity", invoke("log"));
    executor.schedule(6, 2, "Arc", invoke("start mode=cool temp=68F"));

    executor.fire(5);
    executor.fire(6);

    let seen = fired.lock().clone();
    assert_eq!(
        seen,
        vec![
            (5, 1, "Otto".to_string()),
            (6, 2, "Arc".to_string()),
            (6, 3, "Clarity".to_string()),
        ],
        "Arc (actions) must run before Clarity (logging) at beat 6"
    );

    // fetch(6) returns exactly those two entries, in execution order.
    let events = executor.fetch(6);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].agent, "Arc");
    assert_eq!(events[0].payload.action(), "start mode=cool temp=68F");
    assert_eq!(events[1].agent, "Clarity");
    assert_eq!(events[1].payload.action(), "log");
}

/// Round-trip idempotence: `time_to_beat(beat_to_time(b)) == b`.
#[test]
fn time_conversions_round_trip() {
    let executor = executor();
    for beat in 0..2_000 {
        assert_eq!(executor.time_to_beat(executor.beat_to_time(beat)), beat);
    }
    // Spot-check far-out beats
    for beat in [10_000, 1_000_000, 123_456_789] {
        assert_eq!(executor.time_to_beat(executor.beat_to_time(beat)), beat);
    }
}

#[tokio::test(start_paused = true)]
async fn tick_loop_is_beat_monotonic_under_load() {
    let origin = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
    let mut executor = BeatExecutor::with_origin(Duration::from_millis(100), origin);
    let fired: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let fired = Arc::clone(&fired);
        executor.register_agent(
            "Otto",
            Box::new(move |event: &BeatEvent| {
                fired.lock().push(event.beat);
                Ok(())
            }),
        );
    }
    for beat in 0..8 {
        executor.schedule(beat, 1, "Otto", invoke("tick"));
    }

    let task = executor.start();
    // Jump far past all eight intervals at once: the ticker must burst
    // through every beat without skipping or reordering.
    tokio::time::advance(Duration::from_millis(2_000)).await;
    tokio::task::yield_now().await;
    executor.stop();
    let _ = task.await;

    let seen = fired.lock().clone();
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6, 7]);
}

/// Beat-scheduled interrupts land on the scheduler's heap, so the
/// priority model applies inside the deterministic envelope.
#[tokio::test]
async fn beat_interrupt_feeds_the_turn_scheduler() {
    let bus = Bus::new().into_arc();
    let mut cfg = SchedulerConfig {
        min_slice_ms: 10_000,
        max_turn_ms: 1_000,
        reputation_cooldown_ms: 0,
        ..Default::default()
    };
    cfg.max_turns = Some(3);
    let mut sched = Scheduler::new(cfg, QuorumConfig::default(), HashMap::new(), bus);

    sched.register(Agent::scripted(
        "A",
        vec![
            roundtable::agent::SimStep::DelayedReply {
                delay: Duration::from_millis(300),
                text: "alpha".into(),
            },
            roundtable::agent::SimStep::Reply("alpha again".into()),
        ],
    ));
    sched.register(Agent::simulated("Responder", "handled"));

    let executor = BeatExecutor::new(Duration::from_millis(50)).connect_scheduler(sched.handle());
    executor.schedule(
        0,
        2,
        "Responder",
        BeatPayload::Interrupt {
            priority: 95,
            text: "beat-critical".into(),
        },
    );

    // Fire the beat while A's slice is in progress.
    let driver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        executor.fire(0);
    });

    sched.run("begin").await.unwrap();
    driver.await.unwrap();

    let interrupts = sched.transcript().of_kind(EventKind::Interrupt);
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0].agent, "Responder");
    assert_eq!(interrupts[0].payload, "beat-critical");

    let turns: Vec<String> = sched
        .transcript()
        .of_kind(EventKind::Turn)
        .into_iter()
        .map(|e| e.agent)
        .collect();
    assert_eq!(turns[0], "Responder", "interrupter speaks first: {turns:?}");
    assert_eq!(turns[1], "A", "incumbent resumes after the interrupt");
}

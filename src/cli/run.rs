//! Wiring for the `run` and `beats` subcommands.

use super::{BeatsArgs, RunArgs};
use crate::agent::Agent;
use crate::beat::timeline::TimelineView;
use crate::beat::{BeatExecutor, BeatPayload};
use crate::bus::Bus;
use crate::config::Config;
use crate::console::{Console, SchedulerSink};
use crate::sched::Scheduler;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Run the scheduler loop. Returns the process exit code.
pub async fn execute(config: Config, args: RunArgs) -> Result<i32> {
    let bus = Bus::new().into_arc();

    let mut sched_cfg = config.scheduler.clone();
    if args.max_turns.is_some() {
        sched_cfg.max_turns = args.max_turns;
    }
    let mut scheduler = Scheduler::new(
        sched_cfg,
        config.quorum.clone(),
        config.veto_powers.clone(),
        Arc::clone(&bus),
    );

    for spec in &config.agents {
        let agent = if args.simulate {
            Agent::simulated_from_spec(spec)
        } else {
            Agent::from_spec(spec)
        };
        scheduler.register(agent);
    }
    if config.agents.is_empty() {
        tracing::warn!("no agents configured; the run will stop immediately");
    }

    let handle = scheduler.handle();

    // Console loop: reads operator commands from stdin until quit/EOF.
    let console_task = if args.interactive {
        let sink = Arc::new(SchedulerSink::new(handle.clone(), Arc::clone(&bus)));
        let mut console = Console::new(sink, config.groups.clone(), config.templates.clone())
            .with_bus(Arc::clone(&bus));
        Some(tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let outcome = console.dispatch_line(&line).await;
                if !outcome.detail.is_empty() {
                    println!("{}", outcome.detail);
                }
                if outcome.quit {
                    break;
                }
            }
        }))
    } else {
        None
    };

    let result = scheduler.run(&args.prompt).await;

    if let Some(task) = console_task {
        task.abort();
    }

    let transcript = scheduler.transcript();
    if let Some(path) = &args.transcript_out {
        transcript.export_json(path)?;
    }

    match result {
        Ok(outcome) => {
            tracing::info!(?outcome.stop_reason, turns = outcome.turns, "run finished");
            Ok(0)
        }
        Err(fatal) => {
            tracing::error!(error = %fatal, "scheduler invariant violation");
            eprintln!("fatal: {fatal}");
            Ok(2)
        }
    }
}

/// Run the deterministic tick mode: schedule one demo entry per beat,
/// cycling through the configured slots, then print the timeline.
pub async fn beats_demo(config: Config, args: BeatsArgs) -> Result<()> {
    let bus = Bus::new().into_arc();
    let mut executor = BeatExecutor::new(Duration::from_millis(config.beat.duration_ms))
        .connect_bus(Arc::clone(&bus));

    let mut slots: Vec<(String, u8)> = config
        .beat
        .slots
        .iter()
        .map(|(name, idx)| (name.clone(), *idx))
        .collect();
    slots.sort_by_key(|(_, idx)| *idx);
    if slots.is_empty() {
        anyhow::bail!("beat.slots is empty; nothing to schedule");
    }
    for (name, idx) in &slots {
        executor.register_slot(*idx, name.clone());
    }

    executor.register_agent(
        "beats",
        Box::new(|event: &crate::beat::BeatEvent| {
            tracing::info!(
                beat = event.beat,
                slot = event.slot,
                action = event.payload.action(),
                "beat fired"
            );
            Ok(())
        }),
    );

    for beat in 0..args.beats {
        let (name, idx) = &slots[(beat as usize) % slots.len()];
        executor.schedule(
            beat,
            *idx,
            "beats",
            BeatPayload::Invoke {
                action: format!("demo-{name}"),
                args: serde_json::Value::Null,
            },
        );
    }

    let task = executor.start();
    tokio::time::sleep(Duration::from_millis(
        config.beat.duration_ms * (args.beats as u64 + 1),
    ))
    .await;
    executor.stop();
    let _ = task.await;

    let view = TimelineView::new(&executor);
    for beat in 0..args.beats {
        print!("{}", view.format_beat(beat));
    }
    Ok(())
}

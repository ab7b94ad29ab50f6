//! The three-layer turn scheduler.
//!
//! Layer 1 is the round-robin turn queue, layer 2 the priority-heap
//! interrupt protocol, layer 3 arbitration and recovery (timeouts,
//! reputation, leader election, quorum ballots). The scheduler runs as
//! one task that exclusively owns the queue, heap, ledger, ballots, and
//! transcript; everything else talks to it through a command channel,
//! so there is a single writer and no lock is held across a suspension
//! point.
//!
//! Key concepts:
//! - **Slice**: the interval one agent holds the turn-token; bounded by
//!   `max_turn_ms` and pre-emptable under the interrupt rules.
//! - **Pre-emption**: the incumbent is cancelled cooperatively, resumed
//!   later from the head of the queue.
//! - **Livelock freeze**: pre-emption chains deeper than
//!   `max_interrupt_depth` freeze interrupts for one full rotation.
//! - **Leader election**: repeated consecutive failures hand exclusive
//!   speakership to the highest-reputation agent for one rotation.

pub mod ballot;
pub mod interrupt;
pub mod reputation;
pub mod transcript;
pub mod turn_queue;

pub use ballot::{BallotBook, CastOutcome, Proposal, ProposalStatus};
pub use interrupt::{InterruptEntry, InterruptHeap};
pub use reputation::{ReputationEvent, ReputationLedger};
pub use transcript::{EventKind, Transcript, TranscriptCursor, TranscriptEntry};
pub use turn_queue::TurnQueue;

use crate::agent::{Agent, SpeakError, cancel_pair};
use crate::bus::{Bus, BusMessage, GLOBAL_TOPIC, VoteChoice};
use crate::config::{QuorumConfig, SchedulerConfig};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Prompt prefix injected when an interrupter takes the floor.
pub const INTERRUPT_PREFIX: &str = "[INTERRUPT] ";

/// Priority of keyword-triggered auto-interrupts.
const AUTO_INTERRUPT_PRIORITY: u8 = 95;

/// Grace window for cooperative cancellation before the task is aborted.
const CANCEL_GRACE: Duration = Duration::from_millis(50);

/// How often the slice loop re-checks the interrupt heap while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A reply slower than this fraction of the deadline costs reputation.
const SLOW_RESPONSE_FRACTION: f64 = 0.8;

// ─── Errors & outcomes ───────────────────────────────────────────────────

/// Scheduler invariant violations. These abort the run; the binary maps
/// them to exit code 2.
#[derive(Debug)]
pub enum FatalError {
    /// The turn queue drained while active agents are registered
    EmptyQueueWithActiveAgents { active: usize },
    /// An agent would appear twice in the rotation
    DuplicateQueueMembership { agent: String },
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalError::EmptyQueueWithActiveAgents { active } => {
                write!(f, "turn queue empty with {active} active agents")
            }
            FatalError::DuplicateQueueMembership { agent } => {
                write!(f, "agent '{agent}' would be queued twice")
            }
        }
    }
}

impl std::error::Error for FatalError {}

/// Why the run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An agent signalled COMPLETE
    Complete,
    /// `stop()` was requested
    StopRequested,
    /// The configured slice budget ran out
    MaxTurns,
    /// No agents are registered
    EmptyRoster,
}

/// Summary returned by [`Scheduler::run`].
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub stop_reason: StopReason,
    /// Committed TURN entries
    pub turns: u64,
    /// Total slices granted, including failed and preempted ones
    pub slices: u64,
}

// ─── Commands ────────────────────────────────────────────────────────────

/// Producer-side requests serialized into the scheduler task.
#[derive(Debug)]
enum SchedCommand {
    Interrupt {
        agent: String,
        raw_priority: u8,
        payload: String,
    },
    Handoff {
        from: String,
        to: String,
        payload: String,
    },
    Complete {
        agent: String,
    },
    AgentError {
        agent: String,
        detail: String,
    },
    StartBallot {
        id: Uuid,
        proposal_type: String,
        content: String,
        proposer: String,
        deadline: Option<DateTime<Utc>>,
        threshold: Option<f64>,
    },
    CastVote {
        proposal_id: Uuid,
        agent: String,
        choice: VoteChoice,
    },
    Register {
        agent: Box<Agent>,
    },
    Unregister {
        agent: String,
    },
    Mute {
        agent: String,
    },
    Rejoin {
        agent: String,
    },
    Stop,
}

type Roster = Arc<RwLock<HashMap<String, Arc<Agent>>>>;

// ─── Handles ─────────────────────────────────────────────────────────────

/// Full control surface over a running scheduler. Cloneable; all
/// mutations are serialized through the command channel.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedCommand>,
    roster: Roster,
}

impl SchedulerHandle {
    pub fn request_interrupt(&self, agent: &str, raw_priority: u8, payload: &str) {
        let _ = self.tx.send(SchedCommand::Interrupt {
            agent: agent.to_string(),
            raw_priority,
            payload: payload.to_string(),
        });
    }

    pub fn request_handoff(&self, from: &str, to: &str, payload: &str) {
        let _ = self.tx.send(SchedCommand::Handoff {
            from: from.to_string(),
            to: to.to_string(),
            payload: payload.to_string(),
        });
    }

    /// Open a ballot and return its id. The BALLOT event is broadcast
    /// once the command reaches the scheduler task.
    pub fn start_ballot(
        &self,
        proposal_type: &str,
        content: &str,
        proposer: &str,
        deadline: Option<DateTime<Utc>>,
        threshold: Option<f64>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let _ = self.tx.send(SchedCommand::StartBallot {
            id,
            proposal_type: proposal_type.to_string(),
            content: content.to_string(),
            proposer: proposer.to_string(),
            deadline,
            threshold,
        });
        id
    }

    pub fn cast_vote(&self, proposal_id: Uuid, agent: &str, choice: VoteChoice) {
        let _ = self.tx.send(SchedCommand::CastVote {
            proposal_id,
            agent: agent.to_string(),
            choice,
        });
    }

    /// Register an agent while the loop is running. Returns the
    /// capability link to hand to the agent's implementation.
    pub fn register(&self, agent: Agent) -> AgentLink {
        let link = AgentLink {
            agent: agent.handle().to_string(),
            tx: self.tx.clone(),
        };
        let _ = self.tx.send(SchedCommand::Register {
            agent: Box::new(agent),
        });
        link
    }

    pub fn unregister(&self, agent: &str) {
        let _ = self.tx.send(SchedCommand::Unregister {
            agent: agent.to_string(),
        });
    }

    pub fn mute(&self, agent: &str) {
        let _ = self.tx.send(SchedCommand::Mute {
            agent: agent.to_string(),
        });
    }

    pub fn rejoin(&self, agent: &str) {
        let _ = self.tx.send(SchedCommand::Rejoin {
            agent: agent.to_string(),
        });
    }

    pub fn stop(&self) {
        let _ = self.tx.send(SchedCommand::Stop);
    }

    /// Non-blocking roster health snapshot.
    pub fn health(&self) -> Vec<(String, crate::agent::AgentHealth)> {
        let mut out: Vec<_> = self
            .roster
            .read()
            .values()
            .map(|a| (a.handle().to_string(), a.health()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn roster_ids(&self) -> Vec<String> {
        let mut out: Vec<_> = self.roster.read().keys().cloned().collect();
        out.sort();
        out
    }
}

/// The capability object handed to an agent at registration: only the
/// four verbs an agent may use, no scheduler ownership. Tests supply a
/// fake by building one over a throwaway channel.
#[derive(Clone)]
pub struct AgentLink {
    agent: String,
    tx: mpsc::UnboundedSender<SchedCommand>,
}

impl AgentLink {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn request_interrupt(&self, raw_priority: u8, payload: &str) {
        let _ = self.tx.send(SchedCommand::Interrupt {
            agent: self.agent.clone(),
            raw_priority,
            payload: payload.to_string(),
        });
    }

    pub fn request_handoff(&self, to: &str, payload: &str) {
        let _ = self.tx.send(SchedCommand::Handoff {
            from: self.agent.clone(),
            to: to.to_string(),
            payload: payload.to_string(),
        });
    }

    pub fn complete(&self) {
        let _ = self.tx.send(SchedCommand::Complete {
            agent: self.agent.clone(),
        });
    }

    pub fn error(&self, detail: &str) {
        let _ = self.tx.send(SchedCommand::AgentError {
            agent: self.agent.clone(),
            detail: detail.to_string(),
        });
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────

/// Exclusive speakership granted to the elected leader.
#[derive(Debug)]
struct LeaderTerm {
    handle: String,
    slices_left: usize,
    /// Mute order preserved so agents rejoin the tail as they left
    muted_order: Vec<String>,
}

/// How a slice ended.
enum SliceOutcome {
    Replied(String),
    TimedOut,
    Errored(SpeakError),
    Preempted(InterruptEntry),
    CompleteNow,
    StopNow,
}

enum SliceEnd {
    Continue,
    Finished(StopReason),
}

pub struct Scheduler {
    cfg: SchedulerConfig,
    quorum: QuorumConfig,
    bus: Arc<Bus>,
    roster: Roster,
    queue: TurnQueue,
    heap: InterruptHeap,
    ledger: ReputationLedger,
    ballots: BallotBook,
    transcript: Transcript,
    tx: mpsc::UnboundedSender<SchedCommand>,
    rx: mpsc::UnboundedReceiver<SchedCommand>,
    /// Handles currently excluded from the rotation
    muted: Vec<String>,
    interrupt_depth: u32,
    /// Remaining slices with interrupts frozen (livelock recovery)
    freeze_slices: usize,
    failures: HashMap<String, u32>,
    leader: Option<LeaderTerm>,
    pending_handoff: Option<(String, String)>,
    complete_requested: bool,
    running: bool,
    turns: u64,
    slices: u64,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        quorum: QuorumConfig,
        veto_powers: HashMap<String, Vec<String>>,
        bus: Arc<Bus>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cooldown = Duration::from_millis(cfg.reputation_cooldown_ms);
        let weighted = cfg.weighted_voting;
        Self {
            cfg,
            quorum,
            bus,
            roster: Arc::new(RwLock::new(HashMap::new())),
            queue: TurnQueue::new(),
            heap: InterruptHeap::new(),
            ledger: ReputationLedger::new(cooldown),
            ballots: BallotBook::new(weighted, veto_powers),
            transcript: Transcript::new(),
            tx,
            rx,
            muted: Vec::new(),
            interrupt_depth: 0,
            freeze_slices: 0,
            failures: HashMap::new(),
            leader: None,
            pending_handoff: None,
            complete_requested: false,
            running: false,
            turns: 0,
            slices: 0,
        }
    }

    /// Add an agent to the roster and the rotation. Returns the
    /// capability link for the agent's implementation.
    pub fn register(&mut self, agent: Agent) -> AgentLink {
        let handle = agent.handle().to_string();
        let link = AgentLink {
            agent: handle.clone(),
            tx: self.tx.clone(),
        };
        self.roster.write().insert(handle.clone(), Arc::new(agent));
        if !self.queue.contains(&handle) && !self.muted.contains(&handle) {
            self.queue.push_tail(handle.clone());
        }
        tracing::info!(agent = %handle, "agent registered");
        link
    }

    pub fn unregister(&mut self, agent: &str) {
        self.roster.write().remove(agent);
        self.queue.remove(agent);
        self.heap.drain_for(agent);
        self.muted.retain(|a| a != agent);
        self.failures.remove(agent);
        tracing::info!(agent, "agent unregistered");
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
            roster: Arc::clone(&self.roster),
        }
    }

    /// The authoritative log. Cheap to clone; readers use cursors.
    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }

    pub fn reputation_of(&self, agent: &str) -> f64 {
        self.ledger.get(agent)
    }

    fn agent(&self, handle: &str) -> Option<Arc<Agent>> {
        self.roster.read().get(handle).cloned()
    }

    fn active_count(&self) -> usize {
        let roster = self.roster.read();
        roster
            .values()
            .filter(|a| a.is_alive() && !self.muted.contains(&a.handle().to_string()))
            .count()
    }

    // ─── Run loop ────────────────────────────────────────────────────

    /// Drive the conversation until COMPLETE, `stop()`, or the slice
    /// budget runs out. Fatal invariant violations abort the run.
    pub async fn run(&mut self, initial_prompt: &str) -> Result<RunOutcome, FatalError> {
        self.running = true;
        self.complete_requested = false;
        tracing::info!(prompt = initial_prompt, "orchestration starting");

        let mut prompt = initial_prompt.to_string();
        let reason = loop {
            if !self.running {
                break StopReason::StopRequested;
            }
            if self.complete_requested {
                break StopReason::Complete;
            }
            if let Some(max) = self.cfg.max_turns {
                if self.slices >= max {
                    break StopReason::MaxTurns;
                }
            }

            self.expire_due_ballots();

            let Some(speaker) = self.queue.pop_head() else {
                let active = self.active_count();
                if active > 0 {
                    return Err(FatalError::EmptyQueueWithActiveAgents { active });
                }
                self.record_error("scheduler", "empty-roster");
                break StopReason::EmptyRoster;
            };

            match self.run_slice(speaker, &mut prompt).await? {
                SliceEnd::Continue => {}
                SliceEnd::Finished(reason) => break reason,
            }
        };

        self.finish(reason);
        Ok(RunOutcome {
            stop_reason: reason,
            turns: self.turns,
            slices: self.slices,
        })
    }

    /// One slice, including any pre-emption chain it dissolves into.
    async fn run_slice(
        &mut self,
        mut speaker: String,
        prompt: &mut String,
    ) -> Result<SliceEnd, FatalError> {
        loop {
            let Some(agent) = self.agent(&speaker) else {
                // Unregistered while queued; skip the slice entirely.
                tracing::warn!(agent = %speaker, "speaker left the roster, skipping slice");
                return Ok(SliceEnd::Continue);
            };

            // A critical interrupt that is already pending takes the
            // floor before the slice starts; no cancellation needed.
            if let Some(entry) = self.preemption_due(Instant::now(), &speaker) {
                self.apply_preemption(&mut speaker, prompt, entry)?;
                continue;
            }

            self.slices += 1;
            tracing::info!(slice = self.slices, speaker = %speaker, "granting turn-token");

            let (cancel_tx, cancel_rx) = cancel_pair();
            let speak_agent = Arc::clone(&agent);
            let speak_prompt = prompt.clone();
            let mut task =
                tokio::spawn(async move { speak_agent.speak(&speak_prompt, cancel_rx).await });

            let slice_start = Instant::now();
            let deadline = tokio::time::Instant::now()
                + Duration::from_millis(self.cfg.max_turn_ms);
            let mut poll = tokio::time::interval(POLL_INTERVAL);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let outcome = loop {
                tokio::select! {
                    biased;
                    res = &mut task => break match res {
                        Ok(Ok(text)) => SliceOutcome::Replied(text),
                        Ok(Err(err)) => SliceOutcome::Errored(err),
                        Err(join_err) => SliceOutcome::Errored(SpeakError::Protocol(format!(
                            "speak task failed: {join_err}"
                        ))),
                    },
                    _ = tokio::time::sleep_until(deadline) => break SliceOutcome::TimedOut,
                    cmd = self.rx.recv() => {
                        if let Some(cmd) = cmd {
                            if let Some(out) = self.apply_command(cmd, Some(&speaker)) {
                                break out;
                            }
                        }
                    }
                    _ = poll.tick() => {}
                }

                if !self.running {
                    break SliceOutcome::StopNow;
                }
                if let Some(entry) = self.preemption_due(slice_start, &speaker) {
                    break SliceOutcome::Preempted(entry);
                }
            };

            match outcome {
                SliceOutcome::Replied(text) => {
                    let elapsed = slice_start.elapsed();
                    self.commit_turn(&speaker, &text, elapsed)?;
                    *prompt = text;
                    self.after_slice(&speaker)?;
                    return Ok(SliceEnd::Continue);
                }
                SliceOutcome::TimedOut => {
                    self.cancel_speak(cancel_tx, task).await;
                    self.record_error(&speaker, "timeout");
                    self.ledger.adjust(&speaker, ReputationEvent::Timeout);
                    self.requeue_tail(&speaker)?;
                    let count = self.failures.entry(speaker.clone()).or_insert(0);
                    *count += 1;
                    if *count >= self.cfg.failure_trigger {
                        self.elect_leader();
                    }
                    self.after_slice(&speaker)?;
                    return Ok(SliceEnd::Continue);
                }
                SliceOutcome::Errored(err) => {
                    // A Cancelled error with no preemption in flight means
                    // the backend gave up on its own; treat it like any
                    // other agent failure.
                    self.record_error(&speaker, &format!("exception: {err}"));
                    self.ledger.adjust(&speaker, ReputationEvent::AgentError);
                    self.requeue_tail(&speaker)?;
                    let count = self.failures.entry(speaker.clone()).or_insert(0);
                    *count += 1;
                    if *count >= self.cfg.failure_trigger {
                        self.elect_leader();
                    }
                    self.after_slice(&speaker)?;
                    return Ok(SliceEnd::Continue);
                }
                SliceOutcome::Preempted(entry) => {
                    self.cancel_speak(cancel_tx, task).await;
                    self.apply_preemption(&mut speaker, prompt, entry)?;
                    // Re-dispatch with the interrupter holding the token.
                    continue;
                }
                SliceOutcome::CompleteNow => {
                    self.cancel_speak(cancel_tx, task).await;
                    self.requeue_tail(&speaker)?;
                    return Ok(SliceEnd::Finished(StopReason::Complete));
                }
                SliceOutcome::StopNow => {
                    self.cancel_speak(cancel_tx, task).await;
                    self.requeue_tail(&speaker)?;
                    return Ok(SliceEnd::Finished(StopReason::StopRequested));
                }
            }
        }
    }

    /// Hand the token to the interrupter: the incumbent resumes from
    /// the head of the queue, the interrupter leaves its waiting
    /// position, and the prompt becomes the interrupt payload.
    fn apply_preemption(
        &mut self,
        speaker: &mut String,
        prompt: &mut String,
        entry: InterruptEntry,
    ) -> Result<(), FatalError> {
        self.interrupt_depth += 1;
        tracing::info!(
            incumbent = %speaker,
            interrupter = %entry.agent,
            priority = entry.effective_priority,
            depth = self.interrupt_depth,
            "pre-empting slice"
        );

        if self.queue.contains(speaker) {
            return Err(FatalError::DuplicateQueueMembership {
                agent: speaker.clone(),
            });
        }
        self.queue.push_head(speaker.clone());
        self.queue.remove(&entry.agent);

        self.transcript
            .append(&entry.agent, EventKind::Interrupt, &entry.payload);
        *prompt = format!("{INTERRUPT_PREFIX}{}", entry.payload);
        *speaker = entry.agent;
        Ok(())
    }

    /// Cooperative cancellation: signal, give the backend a grace
    /// window, then abort whatever is left. Any reply produced after
    /// this point is discarded.
    async fn cancel_speak(
        &self,
        cancel_tx: tokio::sync::watch::Sender<bool>,
        mut task: tokio::task::JoinHandle<Result<String, SpeakError>>,
    ) {
        let _ = cancel_tx.send(true);
        let _ = tokio::time::timeout(CANCEL_GRACE, &mut task).await;
        task.abort();
    }

    /// Does a pending interrupt qualify to take the floor right now?
    fn preemption_due(&mut self, slice_start: Instant, speaker: &str) -> Option<InterruptEntry> {
        if self.freeze_slices > 0 {
            return None;
        }
        loop {
            let (top_agent, top_priority) = match self.heap.peek() {
                Some(top) => (top.agent.clone(), top.effective_priority),
                None => return None,
            };
            // The incumbent already holds the floor; its own pending
            // request is satisfied trivially.
            if top_agent == speaker {
                self.heap.pop();
                continue;
            }
            // Muted or departed agents cannot take the floor.
            let eligible = {
                let roster = self.roster.read();
                roster
                    .get(&top_agent)
                    .is_some_and(|a| a.is_alive() && !self.muted.contains(&top_agent))
            };
            if !eligible {
                let dropped = self.heap.pop();
                tracing::debug!(?dropped, "discarding interrupt from ineligible agent");
                continue;
            }

            let elapsed = slice_start.elapsed();
            let min_slice = Duration::from_millis(self.cfg.min_slice_ms);
            if elapsed < min_slice && top_priority < self.cfg.preempt_threshold {
                return None;
            }

            // Chain depth guard: past the limit, freeze instead of
            // preempting and let the rotation drain naturally.
            if self.interrupt_depth >= self.cfg.max_interrupt_depth {
                self.freeze_slices = self.active_count().max(1);
                self.interrupt_depth = 0;
                self.record_error("scheduler", "livelock-freeze");
                tracing::warn!(
                    slices = self.freeze_slices,
                    "interrupt depth limit hit, freezing interrupts for one rotation"
                );
                return None;
            }

            return self.heap.pop();
        }
    }

    // ─── Slice bookkeeping ───────────────────────────────────────────

    fn commit_turn(
        &mut self,
        speaker: &str,
        text: &str,
        elapsed: Duration,
    ) -> Result<(), FatalError> {
        self.transcript.append(speaker, EventKind::Turn, text);
        self.bus.publish(
            GLOBAL_TOPIC,
            "scheduler",
            BusMessage::Turn {
                agent: speaker.to_string(),
                text: text.to_string(),
            },
        );
        self.turns += 1;
        self.failures.insert(speaker.to_string(), 0);

        let slow = Duration::from_millis(
            (self.cfg.max_turn_ms as f64 * SLOW_RESPONSE_FRACTION) as u64,
        );
        if elapsed >= slow {
            self.ledger.adjust(speaker, ReputationEvent::SlowResponse);
        }

        self.requeue_tail(speaker)?;
        if self.heap.is_empty() {
            self.interrupt_depth = 0;
        }
        self.scan_keywords(speaker, text);
        Ok(())
    }

    /// Keyword-driven auto-interrupts over a committed reply: the
    /// speaker keeps urgency alive through the global keyword set, and
    /// specialists react to their own configured keywords.
    fn scan_keywords(&mut self, speaker: &str, reply: &str) {
        let lowered = reply.to_lowercase();
        let global_hit = self
            .cfg
            .interrupt_keywords
            .iter()
            .any(|kw| lowered.contains(&kw.to_lowercase()));

        let roster: Vec<Arc<Agent>> = self.roster.read().values().cloned().collect();
        for agent in roster {
            let handle = agent.handle().to_string();
            if !agent.is_alive() || self.muted.contains(&handle) {
                continue;
            }
            let own_hit = agent.keyword_match(reply);
            let relevant = if handle == speaker {
                global_hit
            } else {
                own_hit
            };
            if relevant {
                let priority = AUTO_INTERRUPT_PRIORITY.max(agent.interrupt_threshold());
                self.push_interrupt(&handle, priority, reply);
            }
        }
    }

    fn push_interrupt(&mut self, agent: &str, raw_priority: u8, payload: &str) {
        let reputation = self.ledger.get(agent);
        let entry = self.heap.push(agent, raw_priority, reputation, payload);
        tracing::info!(
            agent,
            raw = raw_priority,
            effective = entry.effective_priority,
            "interrupt queued"
        );
        self.bus.publish(
            GLOBAL_TOPIC,
            "scheduler",
            BusMessage::Interrupt {
                agent: agent.to_string(),
                priority: entry.raw_priority,
                payload: payload.to_string(),
            },
        );
    }

    /// Post-slice housekeeping shared by every outcome: pending
    /// handoffs, leader term countdown, freeze countdown.
    fn after_slice(&mut self, speaker: &str) -> Result<(), FatalError> {
        if self.freeze_slices > 0 {
            self.freeze_slices -= 1;
        }

        if let Some((from, to)) = self.pending_handoff.take() {
            if from == speaker {
                if self.queue.remove(&to) {
                    self.queue.push_head(to.clone());
                    tracing::info!(from = %from, to = %to, "handoff applied, target speaks next");
                } else {
                    tracing::warn!(from = %from, to = %to, "handoff target not in rotation");
                }
            } else {
                // Keep a handoff from a non-incumbent pending.
                self.pending_handoff = Some((from, to));
            }
        }

        let term_over = match self.leader.as_mut() {
            Some(term) if term.handle == speaker => {
                term.slices_left = term.slices_left.saturating_sub(1);
                term.slices_left == 0
            }
            _ => false,
        };
        if term_over {
            if let Some(term) = self.leader.take() {
                for agent in term.muted_order {
                    self.muted.retain(|a| a != &agent);
                    let present = self.roster.read().contains_key(&agent);
                    if present && !self.queue.contains(&agent) {
                        self.queue.push_tail(agent);
                    }
                }
                tracing::info!(leader = %term.handle, "leader rotation over, roster restored");
            }
        }
        Ok(())
    }

    fn requeue_tail(&mut self, speaker: &str) -> Result<(), FatalError> {
        if self.queue.contains(speaker) {
            return Err(FatalError::DuplicateQueueMembership {
                agent: speaker.to_string(),
            });
        }
        let present = self.roster.read().contains_key(speaker);
        if present && !self.muted.contains(&speaker.to_string()) {
            self.queue.push_tail(speaker);
        }
        Ok(())
    }

    fn record_error(&mut self, agent: &str, detail: &str) {
        self.transcript.append(agent, EventKind::Error, detail);
        self.bus.publish(
            GLOBAL_TOPIC,
            "scheduler",
            BusMessage::Error {
                agent: agent.to_string(),
                detail: detail.to_string(),
            },
        );
    }

    // ─── Recovery ────────────────────────────────────────────────────

    /// Hand exclusive speakership to the most reputable agent for one
    /// rotation. Ties break toward the lexicographically lowest handle.
    fn elect_leader(&mut self) {
        if self.leader.is_some() {
            return;
        }
        let candidates: Vec<String> = {
            let roster = self.roster.read();
            roster
                .values()
                .filter(|a| a.is_alive() && !self.muted.contains(&a.handle().to_string()))
                .map(|a| a.handle().to_string())
                .collect()
        };
        let Some(leader) = candidates.iter().cloned().reduce(|best, candidate| {
            let best_rep = self.ledger.get(&best);
            let cand_rep = self.ledger.get(&candidate);
            match cand_rep.total_cmp(&best_rep) {
                std::cmp::Ordering::Greater => candidate,
                std::cmp::Ordering::Equal if candidate < best => candidate,
                _ => best,
            }
        }) else {
            return;
        };

        let rotation = candidates.len();
        let mut muted_order = Vec::new();
        for agent in self.queue.snapshot() {
            if agent != leader {
                self.queue.remove(&agent);
                self.muted.push(agent.clone());
                muted_order.push(agent);
            }
        }
        // The leader may be mid-slice (not queued); the requeue guard
        // puts it back afterwards.

        self.transcript.append(
            "scheduler",
            EventKind::Ballot,
            format!("leader-election: {leader}"),
        );
        self.bus.publish(
            GLOBAL_TOPIC,
            "scheduler",
            BusMessage::Ballot {
                proposal_id: Uuid::new_v4(),
                proposal_type: "leader-election".to_string(),
                content: format!("leader-election: {leader}"),
                proposer: "scheduler".to_string(),
            },
        );
        tracing::warn!(
            leader = %leader,
            reputation = self.ledger.get(&leader),
            rotation,
            "leader elected for recovery rotation"
        );
        self.leader = Some(LeaderTerm {
            handle: leader,
            slices_left: rotation,
            muted_order,
        });
    }

    // ─── Commands ────────────────────────────────────────────────────

    /// Apply a producer command. Returns a slice outcome when the
    /// command ends the slice in progress.
    fn apply_command(
        &mut self,
        cmd: SchedCommand,
        current_speaker: Option<&str>,
    ) -> Option<SliceOutcome> {
        match cmd {
            SchedCommand::Interrupt {
                agent,
                raw_priority,
                payload,
            } => {
                self.push_interrupt(&agent, raw_priority, &payload);
                None
            }
            SchedCommand::Handoff { from, to, payload } => {
                let known = self.roster.read().contains_key(&to);
                if !known {
                    tracing::warn!(from = %from, to = %to, "handoff to unknown agent ignored");
                    return None;
                }
                self.transcript.append(
                    &from,
                    EventKind::Handoff,
                    format!("{from} -> {to}: {payload}"),
                );
                self.bus.publish(
                    GLOBAL_TOPIC,
                    "scheduler",
                    BusMessage::Handoff {
                        from: from.clone(),
                        to: to.clone(),
                        payload,
                    },
                );
                self.pending_handoff = Some((from, to));
                None
            }
            SchedCommand::Complete { agent } => {
                self.transcript.append(&agent, EventKind::Complete, "");
                self.bus.publish(
                    GLOBAL_TOPIC,
                    "scheduler",
                    BusMessage::Complete {
                        agent: agent.clone(),
                    },
                );
                self.complete_requested = true;
                if current_speaker == Some(agent.as_str()) {
                    Some(SliceOutcome::CompleteNow)
                } else {
                    None
                }
            }
            SchedCommand::AgentError { agent, detail } => {
                self.record_error(&agent, &detail);
                self.ledger.adjust(&agent, ReputationEvent::AgentError);
                None
            }
            SchedCommand::StartBallot {
                id,
                proposal_type,
                content,
                proposer,
                deadline,
                threshold,
            } => {
                self.open_ballot(id, &proposal_type, &content, &proposer, deadline, threshold);
                None
            }
            SchedCommand::CastVote {
                proposal_id,
                agent,
                choice,
            } => {
                self.record_vote(proposal_id, &agent, choice);
                None
            }
            SchedCommand::Register { agent } => {
                self.register(*agent);
                None
            }
            SchedCommand::Unregister { agent } => {
                self.unregister(&agent);
                None
            }
            SchedCommand::Mute { agent } => {
                if !self.muted.contains(&agent) {
                    self.muted.push(agent.clone());
                }
                self.queue.remove(&agent);
                let dropped = self.heap.drain_for(&agent);
                tracing::info!(agent, dropped = dropped.len(), "agent muted");
                None
            }
            SchedCommand::Rejoin { agent } => {
                self.muted.retain(|a| a != &agent);
                let present = self.roster.read().contains_key(&agent);
                if present
                    && !self.queue.contains(&agent)
                    && current_speaker != Some(agent.as_str())
                {
                    self.queue.push_tail(agent.clone());
                }
                tracing::info!(agent, "agent rejoined rotation");
                None
            }
            SchedCommand::Stop => {
                self.running = false;
                Some(SliceOutcome::StopNow)
            }
        }
    }

    // ─── Ballots ─────────────────────────────────────────────────────

    fn open_ballot(
        &mut self,
        id: Uuid,
        proposal_type: &str,
        content: &str,
        proposer: &str,
        deadline: Option<DateTime<Utc>>,
        threshold: Option<f64>,
    ) {
        let rule = self.quorum.rules.get(proposal_type);
        let threshold = threshold
            .or_else(|| rule.map(|r| r.threshold))
            .unwrap_or(self.cfg.quorum_default);
        let minimum_participants = rule.map(|r| r.minimum_participants as usize).unwrap_or(1);
        let deadline = deadline.unwrap_or_else(|| {
            let timeout = rule.map(|r| r.vote_timeout_sec).unwrap_or(30);
            Utc::now() + ChronoDuration::seconds(timeout as i64)
        });

        self.ballots.open(
            id,
            proposal_type,
            content,
            proposer,
            threshold,
            minimum_participants,
            deadline,
        );
        self.transcript
            .append(proposer, EventKind::Ballot, content);
        self.bus.publish(
            GLOBAL_TOPIC,
            "scheduler",
            BusMessage::Ballot {
                proposal_id: id,
                proposal_type: proposal_type.to_string(),
                content: content.to_string(),
                proposer: proposer.to_string(),
            },
        );
    }

    fn record_vote(&mut self, proposal_id: Uuid, agent: &str, choice: VoteChoice) {
        // Weighted mode scales each vote by reputation and by the
        // agent's configured weight.
        let weights: HashMap<String, f64> = {
            let roster = self.roster.read();
            roster
                .iter()
                .map(|(h, a)| (h.clone(), self.ledger.get(h) * a.weight()))
                .collect()
        };
        let outcome = self.ballots.cast(&proposal_id, agent, choice, |handle| {
            weights.get(handle).copied().unwrap_or(1.0)
        });

        match outcome {
            CastOutcome::Recorded | CastOutcome::Settled(_) => {
                self.transcript.append(
                    agent,
                    EventKind::Vote,
                    format!("{proposal_id}: {choice:?}"),
                );
                self.bus.publish(
                    GLOBAL_TOPIC,
                    "scheduler",
                    BusMessage::Vote {
                        proposal_id,
                        agent: agent.to_string(),
                        choice,
                    },
                );
            }
            CastOutcome::Expired => {
                self.publish_ballot_result(proposal_id, ProposalStatus::Expired);
                return;
            }
            CastOutcome::Ignored(reason) => {
                tracing::debug!(%proposal_id, agent, reason, "vote ignored");
                return;
            }
        }

        if let CastOutcome::Settled(status) = outcome {
            self.settle_ballot(proposal_id, status);
        }
    }

    /// Terminal tally: publish the result and apply reputation deltas
    /// to the proposer and every voter.
    fn settle_ballot(&mut self, proposal_id: Uuid, status: ProposalStatus) {
        self.publish_ballot_result(proposal_id, status);

        let Some(proposal) = self.ballots.get(&proposal_id).cloned() else {
            return;
        };
        let proposer_event = match status {
            ProposalStatus::Approved => Some(ReputationEvent::ProposalApproved),
            ProposalStatus::Rejected => Some(ReputationEvent::ProposalRejected),
            _ => None,
        };
        if let Some(event) = proposer_event {
            self.ledger.adjust(&proposal.proposer, event);
        }

        let winning = match status {
            ProposalStatus::Approved => VoteChoice::Approve,
            ProposalStatus::Rejected => VoteChoice::Reject,
            _ => return,
        };
        for (voter, choice) in &proposal.votes {
            let event = if *choice == winning {
                ReputationEvent::ConsensusAgreement
            } else {
                ReputationEvent::ConsensusDisagreement
            };
            self.ledger.adjust(voter, event);
        }
    }

    fn publish_ballot_result(&mut self, proposal_id: Uuid, status: ProposalStatus) {
        self.transcript.append(
            "scheduler",
            EventKind::Ballot,
            format!("{proposal_id}: {status}"),
        );
        self.bus.publish(
            GLOBAL_TOPIC,
            "scheduler",
            BusMessage::BallotResult {
                proposal_id,
                status: status.to_string(),
            },
        );
    }

    fn expire_due_ballots(&mut self) {
        for id in self.ballots.expire_due(Utc::now()) {
            self.publish_ballot_result(id, ProposalStatus::Expired);
        }
    }

    // ─── Shutdown ────────────────────────────────────────────────────

    fn finish(&mut self, reason: StopReason) {
        self.running = false;

        // Drain commands that raced the shutdown so votes and errors
        // are not silently lost from the record.
        while let Ok(cmd) = self.rx.try_recv() {
            if !matches!(cmd, SchedCommand::Stop) {
                self.apply_command(cmd, None);
            }
        }

        let pending = self.heap.drain_all();
        if reason == StopReason::Complete {
            for entry in &pending {
                self.record_error(&entry.agent, "dropped-on-complete");
            }
        } else if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "pending interrupts discarded on stop");
        }

        for id in self.ballots.expire_all() {
            self.publish_ballot_result(id, ProposalStatus::Expired);
        }

        tracing::info!(
            ?reason,
            turns = self.turns,
            slices = self.slices,
            "orchestration finished"
        );
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SimStep;

    fn fast_cfg() -> SchedulerConfig {
        SchedulerConfig {
            min_slice_ms: 50,
            max_turn_ms: 200,
            reputation_cooldown_ms: 0,
            max_turns: Some(64),
            ..Default::default()
        }
    }

    fn scheduler(cfg: SchedulerConfig) -> Scheduler {
        Scheduler::new(cfg, QuorumConfig::default(), HashMap::new(), Bus::new().into_arc())
    }

    #[tokio::test]
    async fn empty_roster_stops_with_error_entry() {
        let mut sched = scheduler(fast_cfg());
        let outcome = sched.run("begin").await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EmptyRoster);

        let errors = sched.transcript().of_kind(EventKind::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload, "empty-roster");
    }

    #[tokio::test]
    async fn max_turns_bounds_the_run() {
        let mut cfg = fast_cfg();
        cfg.max_turns = Some(5);
        let mut sched = scheduler(cfg);
        sched.register(Agent::simulated("A", "ok"));
        sched.register(Agent::simulated("B", "ok"));

        let outcome = sched.run("begin").await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::MaxTurns);
        assert_eq!(outcome.slices, 5);
    }

    #[tokio::test]
    async fn complete_from_speaker_finishes_gracefully() {
        let mut sched = scheduler(fast_cfg());
        let link_holder = sched.handle();
        sched.register(Agent::simulated("A", "ok"));
        sched.register(Agent::simulated("B", "ok"));

        // Signal COMPLETE out-of-band after a few turns.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            let link = AgentLink {
                agent: "A".to_string(),
                tx: link_holder.tx.clone(),
            };
            link.complete();
        });

        let outcome = sched.run("begin").await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Complete);
        let completes = sched.transcript().of_kind(EventKind::Complete);
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].agent, "A");
    }

    #[tokio::test]
    async fn leader_election_prefers_reputation_then_lowest_handle() {
        let mut sched = scheduler(fast_cfg());
        sched.register(Agent::simulated("B", "ok"));
        sched.register(Agent::simulated("C", "ok"));
        sched.register(Agent::simulated("A", "ok"));

        // Equal reputation everywhere: lowest handle wins.
        sched.elect_leader();
        assert_eq!(sched.leader.as_ref().unwrap().handle, "A");

        // Reset and penalize A: the best-reputation agent wins.
        sched.leader = None;
        sched.muted.clear();
        sched.ledger.adjust("A", ReputationEvent::Timeout);
        sched.elect_leader();
        assert_eq!(sched.leader.as_ref().unwrap().handle, "B");
    }

    #[tokio::test]
    async fn keyword_in_reply_queues_auto_interrupt() {
        let mut sched = scheduler(fast_cfg());
        sched.register(Agent::simulated("A", "ok"));
        sched.register(
            Agent::simulated("Sentinel", "on it").with_keywords(vec!["breach".into()], 97),
        );

        sched.scan_keywords("A", "we may have a breach in the vault");
        let top = sched.heap.peek().expect("specialist interrupt queued");
        assert_eq!(top.agent, "Sentinel");
        assert_eq!(top.raw_priority, 97);
    }

    #[tokio::test]
    async fn global_keyword_keeps_speaker_urgent() {
        let mut sched = scheduler(fast_cfg());
        sched.register(Agent::simulated("A", "ok"));
        sched.register(Agent::simulated("B", "ok"));

        sched.scan_keywords("A", "this is urgent, drop everything");
        let top = sched.heap.peek().expect("speaker interrupt queued");
        assert_eq!(top.agent, "A");
        assert_eq!(top.raw_priority, AUTO_INTERRUPT_PRIORITY);
    }

    #[tokio::test]
    async fn failing_agent_triggers_election_and_leader_rotation() {
        let mut cfg = fast_cfg();
        cfg.max_turns = Some(24);
        let mut sched = scheduler(cfg);
        sched.register(Agent::simulated("A", "ok"));
        sched.register(Agent::scripted("B", vec![SimStep::Hang]));
        sched.register(Agent::simulated("C", "ok"));

        let outcome = sched.run("begin").await.unwrap();
        assert!(outcome.turns > 0);

        // Three timeouts from B appear, then a leader-election ballot.
        let errors = sched.transcript().of_kind(EventKind::Error);
        let b_timeouts = errors
            .iter()
            .filter(|e| e.agent == "B" && e.payload == "timeout")
            .count();
        assert!(b_timeouts >= 3, "expected >= 3 timeouts, saw {b_timeouts}");

        let ballots = sched.transcript().of_kind(EventKind::Ballot);
        assert!(
            ballots.iter().any(|b| b.payload.starts_with("leader-election:")),
            "expected a leader-election event"
        );
    }

    #[tokio::test]
    async fn unregistered_speaker_does_not_requeue() {
        let mut sched = scheduler(fast_cfg());
        sched.register(Agent::simulated("A", "ok"));
        sched.unregister("A");
        assert!(sched.queue.is_empty());
        sched.requeue_tail("A").unwrap();
        assert!(sched.queue.is_empty());
    }
}

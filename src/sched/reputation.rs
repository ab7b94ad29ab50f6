//! Reliability scores with noise-resistant cooldowns.
//!
//! Scores live in [0, 1] and start at 1.0. Each delta kind carries a
//! fixed magnitude; applying a kind to an agent inside its cooldown
//! window is a no-op, so a burst of identical failures costs only one
//! hit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default suppression window for repeated deltas of the same kind.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Why a reputation score is changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReputationEvent {
    Timeout,
    AgentError,
    SlowResponse,
    ProposalApproved,
    ProposalRejected,
    ConsensusAgreement,
    ConsensusDisagreement,
}

impl ReputationEvent {
    pub fn delta(self) -> f64 {
        match self {
            ReputationEvent::Timeout => -0.2,
            ReputationEvent::AgentError => -0.1,
            ReputationEvent::SlowResponse => -0.05,
            ReputationEvent::ProposalApproved => 0.03,
            ReputationEvent::ProposalRejected => -0.03,
            ReputationEvent::ConsensusAgreement => 0.02,
            ReputationEvent::ConsensusDisagreement => -0.05,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReputationEvent::Timeout => "timeout",
            ReputationEvent::AgentError => "error",
            ReputationEvent::SlowResponse => "slow_response",
            ReputationEvent::ProposalApproved => "proposal_approved",
            ReputationEvent::ProposalRejected => "proposal_rejected",
            ReputationEvent::ConsensusAgreement => "consensus_agreement",
            ReputationEvent::ConsensusDisagreement => "consensus_disagreement",
        }
    }
}

#[derive(Debug)]
pub struct ReputationLedger {
    scores: HashMap<String, f64>,
    last_applied: HashMap<(String, ReputationEvent), Instant>,
    cooldown: Duration,
}

impl ReputationLedger {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            scores: HashMap::new(),
            last_applied: HashMap::new(),
            cooldown,
        }
    }

    /// Unknown agents report the initial score of 1.0.
    pub fn get(&self, agent: &str) -> f64 {
        self.scores.get(agent).copied().unwrap_or(1.0)
    }

    /// Apply a delta kind if its cooldown allows, clamping to [0, 1].
    /// Returns the score after the call either way.
    pub fn adjust(&mut self, agent: &str, kind: ReputationEvent) -> f64 {
        if !self.cooldown_ok(agent, kind) {
            tracing::debug!(agent, kind = kind.name(), "reputation delta suppressed by cooldown");
            return self.get(agent);
        }
        self.mark(agent, kind);
        let score = (self.get(agent) + kind.delta()).clamp(0.0, 1.0);
        self.scores.insert(agent.to_string(), score);
        tracing::debug!(agent, kind = kind.name(), score, "reputation adjusted");
        score
    }

    /// Has the cooldown window for this (agent, kind) elapsed?
    pub fn cooldown_ok(&self, agent: &str, kind: ReputationEvent) -> bool {
        match self.last_applied.get(&(agent.to_string(), kind)) {
            Some(at) => at.elapsed() >= self.cooldown,
            None => true,
        }
    }

    /// Stamp the last-applied time without changing the score.
    pub fn mark(&mut self, agent: &str, kind: ReputationEvent) {
        self.last_applied
            .insert((agent.to_string(), kind), Instant::now());
    }

    /// All known scores (agents never adjusted are absent).
    pub fn snapshot(&self) -> &HashMap<String, f64> {
        &self.scores
    }
}

impl Default for ReputationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

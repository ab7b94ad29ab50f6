//! Fair rotation order for the turn-token.
//!
//! Every active, non-muted agent appears exactly once. The scheduler
//! pops the head to grant the token, pushes to the tail after a normal
//! slice, and pushes to the head to resume a preempted speaker.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct TurnQueue {
    order: VecDeque<String>,
}

impl TurnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the token: remove and return the current head.
    pub fn pop_head(&mut self) -> Option<String> {
        self.order.pop_front()
    }

    /// Normal end of slice: speaker rejoins at the back.
    pub fn push_tail(&mut self, agent: impl Into<String>) {
        let agent = agent.into();
        debug_assert!(!self.contains(&agent), "agent {agent} already queued");
        self.order.push_back(agent);
    }

    /// Resume a preempted speaker ahead of everyone else.
    pub fn push_head(&mut self, agent: impl Into<String>) {
        let agent = agent.into();
        debug_assert!(!self.contains(&agent), "agent {agent} already queued");
        self.order.push_front(agent);
    }

    /// Mute: drop the agent from the rotation. Returns whether it was queued.
    pub fn remove(&mut self, agent: &str) -> bool {
        match self.position_of(agent) {
            Some(idx) => {
                self.order.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Rejoin after a mute, directly behind `reference`. Falls back to
    /// the tail when the reference is not queued.
    pub fn insert_after(&mut self, reference: &str, agent: impl Into<String>) {
        let agent = agent.into();
        debug_assert!(!self.contains(&agent), "agent {agent} already queued");
        match self.position_of(reference) {
            Some(idx) => self.order.insert(idx + 1, agent),
            None => self.order.push_back(agent),
        }
    }

    pub fn position_of(&self, agent: &str) -> Option<usize> {
        self.order.iter().position(|a| a == agent)
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.position_of(agent).is_some()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Current rotation order, head first.
    pub fn snapshot(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

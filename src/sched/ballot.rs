//! Consensus proposals and quorum voting.
//!
//! A proposal opens, collects at most one vote per agent, and settles
//! into exactly one terminal state. The tally runs on every vote:
//! approvals/(approvals+rejections) at or above the threshold approves,
//! the symmetric rejection ratio rejects, and a missed deadline expires.
//! Weighted mode multiplies each vote by the voter's reputation. An
//! agent holding veto power over a proposal type rejects it outright by
//! voting REJECT.

use crate::bus::VoteChoice;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Open,
    Approved,
    Rejected,
    Expired,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalStatus::Open => write!(f, "open"),
            ProposalStatus::Approved => write!(f, "approved"),
            ProposalStatus::Rejected => write!(f, "rejected"),
            ProposalStatus::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: Uuid,
    pub proposal_type: String,
    pub content: String,
    pub proposer: String,
    pub status: ProposalStatus,
    pub threshold: f64,
    pub minimum_participants: usize,
    pub deadline: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
    pub votes: HashMap<String, VoteChoice>,
}

/// What happened when a vote was offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastOutcome {
    /// Vote recorded, proposal still open
    Recorded,
    /// Vote recorded and it settled the proposal
    Settled(ProposalStatus),
    /// The deadline had already passed; the vote is ignored
    Expired,
    /// Unknown proposal, closed proposal, or duplicate voter
    Ignored(&'static str),
}

/// The set of proposals the scheduler has opened.
#[derive(Debug, Default)]
pub struct BallotBook {
    proposals: HashMap<Uuid, Proposal>,
    /// Multiply votes by voter reputation when tallying
    weighted: bool,
    /// agent handle -> proposal types it may unilaterally block
    veto_powers: HashMap<String, Vec<String>>,
}

impl BallotBook {
    pub fn new(weighted: bool, veto_powers: HashMap<String, Vec<String>>) -> Self {
        Self {
            proposals: HashMap::new(),
            weighted,
            veto_powers,
        }
    }

    /// Open a proposal. The id is the caller's (so it can be returned
    /// before the command is serialized into the scheduler task).
    pub fn open(
        &mut self,
        id: Uuid,
        proposal_type: &str,
        content: &str,
        proposer: &str,
        threshold: f64,
        minimum_participants: usize,
        deadline: DateTime<Utc>,
    ) -> &Proposal {
        let proposal = Proposal {
            id,
            proposal_type: proposal_type.to_string(),
            content: content.to_string(),
            proposer: proposer.to_string(),
            status: ProposalStatus::Open,
            threshold,
            minimum_participants,
            deadline,
            opened_at: Utc::now(),
            votes: HashMap::new(),
        };
        tracing::info!(
            proposal = %id,
            kind = proposal_type,
            threshold,
            "ballot opened"
        );
        self.proposals.entry(id).or_insert(proposal)
    }

    pub fn get(&self, id: &Uuid) -> Option<&Proposal> {
        self.proposals.get(id)
    }

    /// Record a vote and re-tally. `reputation_of` supplies the weight
    /// for weighted mode.
    pub fn cast(
        &mut self,
        id: &Uuid,
        agent: &str,
        choice: VoteChoice,
        reputation_of: impl Fn(&str) -> f64,
    ) -> CastOutcome {
        let weighted = self.weighted;
        let has_veto = self
            .veto_powers
            .get(agent)
            .is_some_and(|types| {
                self.proposals
                    .get(id)
                    .is_some_and(|p| types.contains(&p.proposal_type))
            });

        let Some(proposal) = self.proposals.get_mut(id) else {
            return CastOutcome::Ignored("unknown proposal");
        };
        if proposal.status != ProposalStatus::Open {
            return CastOutcome::Ignored("proposal already settled");
        }
        if Utc::now() > proposal.deadline {
            proposal.status = ProposalStatus::Expired;
            tracing::warn!(proposal = %id, "late vote ignored, ballot expired");
            return CastOutcome::Expired;
        }
        if proposal.votes.contains_key(agent) {
            return CastOutcome::Ignored("duplicate vote");
        }

        proposal.votes.insert(agent.to_string(), choice);

        // Veto settles immediately, regardless of threshold or weights.
        if has_veto && choice == VoteChoice::Reject {
            proposal.status = ProposalStatus::Rejected;
            tracing::info!(proposal = %id, agent, "vetoed");
            return CastOutcome::Settled(ProposalStatus::Rejected);
        }

        match tally(proposal, weighted, reputation_of) {
            Some(status) => {
                proposal.status = status;
                CastOutcome::Settled(status)
            }
            None => CastOutcome::Recorded,
        }
    }

    /// Expire every open proposal whose deadline has passed. Returns
    /// the ids that transitioned.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut expired = Vec::new();
        for proposal in self.proposals.values_mut() {
            if proposal.status == ProposalStatus::Open && now > proposal.deadline {
                proposal.status = ProposalStatus::Expired;
                expired.push(proposal.id);
            }
        }
        expired
    }

    /// Expire everything still open (scheduler stop).
    pub fn expire_all(&mut self) -> Vec<Uuid> {
        let mut expired = Vec::new();
        for proposal in self.proposals.values_mut() {
            if proposal.status == ProposalStatus::Open {
                proposal.status = ProposalStatus::Expired;
                expired.push(proposal.id);
            }
        }
        expired
    }

    pub fn open_count(&self) -> usize {
        self.proposals
            .values()
            .filter(|p| p.status == ProposalStatus::Open)
            .count()
    }
}

/// Decide whether the votes settle the proposal. `None` keeps it open.
fn tally(
    proposal: &Proposal,
    weighted: bool,
    reputation_of: impl Fn(&str) -> f64,
) -> Option<ProposalStatus> {
    let participants = proposal.votes.len();
    if participants < proposal.minimum_participants {
        return None;
    }

    let mut approve = 0.0_f64;
    let mut reject = 0.0_f64;
    for (agent, choice) in &proposal.votes {
        let weight = if weighted { reputation_of(agent) } else { 1.0 };
        match choice {
            VoteChoice::Approve => approve += weight,
            VoteChoice::Reject => reject += weight,
        }
    }
    let total = approve + reject;
    if total <= 0.0 {
        return None;
    }

    if approve / total >= proposal.threshold {
        Some(ProposalStatus::Approved)
    } else if reject / total > 1.0 - proposal.threshold {
        Some(ProposalStatus::Rejected)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn far_deadline() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(3600)
    }

    fn flat(_: &str) -> f64 {
        1.0
    }

    #[test]
    fn approves_at_two_thirds_with_min_participants() {
        let mut book = BallotBook::new(false, HashMap::new());
        let id = Uuid::new_v4();
        book.open(id, "policy", "P", "A", 0.66, 3, far_deadline());

        assert_eq!(book.cast(&id, "A", VoteChoice::Approve, flat), CastOutcome::Recorded);
        // 2/2 approvals but only 2 participants: stays open
        assert_eq!(book.cast(&id, "B", VoteChoice::Approve, flat), CastOutcome::Recorded);
        // Third vote: 2/3 ≈ 0.667 >= 0.66 and participation met
        assert_eq!(
            book.cast(&id, "C", VoteChoice::Reject, flat),
            CastOutcome::Settled(ProposalStatus::Approved)
        );
    }

    #[test]
    fn symmetric_rejection_threshold() {
        let mut book = BallotBook::new(false, HashMap::new());
        let id = Uuid::new_v4();
        book.open(id, "policy", "P", "A", 0.66, 2, far_deadline());

        book.cast(&id, "A", VoteChoice::Reject, flat);
        // 2 rejections of 2: 1.0 > 1 - 0.66
        assert_eq!(
            book.cast(&id, "B", VoteChoice::Reject, flat),
            CastOutcome::Settled(ProposalStatus::Rejected)
        );
    }

    #[test]
    fn duplicate_votes_are_ignored() {
        let mut book = BallotBook::new(false, HashMap::new());
        let id = Uuid::new_v4();
        book.open(id, "policy", "P", "A", 0.66, 3, far_deadline());

        assert_eq!(book.cast(&id, "A", VoteChoice::Approve, flat), CastOutcome::Recorded);
        assert_eq!(
            book.cast(&id, "A", VoteChoice::Reject, flat),
            CastOutcome::Ignored("duplicate vote")
        );
        assert_eq!(book.get(&id).unwrap().votes.len(), 1);
    }

    #[test]
    fn votes_after_settlement_are_ignored() {
        let mut book = BallotBook::new(false, HashMap::new());
        let id = Uuid::new_v4();
        book.open(id, "policy", "P", "A", 1.0, 1, far_deadline());
        book.cast(&id, "A", VoteChoice::Approve, flat);

        assert_eq!(
            book.cast(&id, "B", VoteChoice::Reject, flat),
            CastOutcome::Ignored("proposal already settled")
        );
    }

    #[test]
    fn deadline_expires_and_ignores_late_votes() {
        let mut book = BallotBook::new(false, HashMap::new());
        let id = Uuid::new_v4();
        let past = Utc::now() - ChronoDuration::seconds(1);
        book.open(id, "policy", "P", "A", 0.66, 1, past);

        assert_eq!(book.cast(&id, "A", VoteChoice::Approve, flat), CastOutcome::Expired);
        assert_eq!(book.get(&id).unwrap().status, ProposalStatus::Expired);
        assert!(book.get(&id).unwrap().votes.is_empty());
    }

    #[test]
    fn expire_due_settles_only_past_deadline() {
        let mut book = BallotBook::new(false, HashMap::new());
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        book.open(stale, "policy", "old", "A", 0.66, 1, Utc::now() - ChronoDuration::seconds(5));
        book.open(fresh, "policy", "new", "A", 0.66, 1, far_deadline());

        let expired = book.expire_due(Utc::now());
        assert_eq!(expired, vec![stale]);
        assert_eq!(book.get(&fresh).unwrap().status, ProposalStatus::Open);
    }

    #[test]
    fn weighted_mode_multiplies_by_reputation() {
        let mut book = BallotBook::new(true, HashMap::new());
        let id = Uuid::new_v4();
        book.open(id, "policy", "P", "A", 0.66, 2, far_deadline());

        // Approver carries weight 1.0, rejector only 0.1: 1.0/1.1 ≈ 0.91
        let rep = |agent: &str| if agent == "low" { 0.1 } else { 1.0 };
        book.cast(&id, "low", VoteChoice::Reject, rep);
        assert_eq!(
            book.cast(&id, "high", VoteChoice::Approve, rep),
            CastOutcome::Settled(ProposalStatus::Approved)
        );
    }

    #[test]
    fn veto_rejects_immediately() {
        let mut veto = HashMap::new();
        veto.insert("Sentinel".to_string(), vec!["shutdown".to_string()]);
        let mut book = BallotBook::new(false, veto);
        let id = Uuid::new_v4();
        book.open(id, "shutdown", "halt", "A", 0.9, 5, far_deadline());

        // One REJECT from the veto holder settles it despite 0.9
        // threshold and 5-participant minimum.
        assert_eq!(
            book.cast(&id, "Sentinel", VoteChoice::Reject, flat),
            CastOutcome::Settled(ProposalStatus::Rejected)
        );
    }

    #[test]
    fn veto_power_does_not_apply_to_other_types() {
        let mut veto = HashMap::new();
        veto.insert("Sentinel".to_string(), vec!["shutdown".to_string()]);
        let mut book = BallotBook::new(false, veto);
        let id = Uuid::new_v4();
        book.open(id, "policy", "P", "A", 0.66, 3, far_deadline());

        assert_eq!(
            book.cast(&id, "Sentinel", VoteChoice::Reject, flat),
            CastOutcome::Recorded
        );
    }
}

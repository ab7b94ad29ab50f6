//! Configuration system
//!
//! Handles loading the roster and tuning knobs from JSON:
//! - Explicit path (`--config`)
//! - Project config (./roundtable.json)
//! - User config (~/.config/roundtable/config.json)
//! - Built-in defaults
//!
//! Invalid configuration refuses to start: duplicate agent ids, missing
//! required fields, veto powers referencing unknown proposal types, and
//! groups referencing unknown agents are all startup errors.

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// The agent roster
    #[serde(default)]
    pub agents: Vec<AgentSpec>,

    /// Named groups of agent ids for group-addressed commands
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,

    /// Prompt templates with `[TOPIC]` / `[SITUATION]` placeholders
    #[serde(default)]
    pub templates: HashMap<String, String>,

    /// Scheduler tuning knobs
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Beat executor settings
    #[serde(default)]
    pub beat: BeatConfig,

    /// Quorum rules per proposal type
    #[serde(default)]
    pub quorum: QuorumConfig,

    /// agent id -> proposal types it may unilaterally block
    #[serde(default)]
    pub veto_powers: HashMap<String, Vec<String>>,
}

/// One agent entry in the roster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Stable handle, unique across the roster
    pub id: String,

    /// Role tag (orchestrator, security, researcher, ...)
    pub role: String,

    /// Base URL of the model endpoint
    pub endpoint: String,

    /// Model identifier passed to the endpoint
    pub model: String,

    /// System prompt prepended by the endpoint
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Vote weight override (defaults to 1.0)
    #[serde(default)]
    pub weight: Option<f64>,

    /// Whether the run should refuse to start without this agent
    #[serde(default)]
    pub required: bool,

    /// Agent-specific substrings that trigger auto-interrupts
    #[serde(default)]
    pub interrupt_keywords: Vec<String>,

    /// Floor for this agent's auto-interrupt priority
    #[serde(default)]
    pub interrupt_threshold: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Minimum airtime before a non-critical interrupt may pre-empt
    #[serde(default = "default_min_slice_ms")]
    pub min_slice_ms: u64,

    /// Per-slice deadline
    #[serde(default = "default_max_turn_ms")]
    pub max_turn_ms: u64,

    /// Effective priority allowing immediate pre-emption
    #[serde(default = "default_preempt_threshold")]
    pub preempt_threshold: f64,

    /// Pre-emption chain limit before a forced freeze
    #[serde(default = "default_max_interrupt_depth")]
    pub max_interrupt_depth: u32,

    /// Consecutive failures initiating leader election
    #[serde(default = "default_failure_trigger")]
    pub failure_trigger: u32,

    /// Fraction approving required for ballots without a per-type rule
    #[serde(default = "default_quorum")]
    pub quorum_default: f64,

    /// Substrings causing an auto-interrupt at priority 95
    #[serde(default = "default_interrupt_keywords")]
    pub interrupt_keywords: Vec<String>,

    /// Multiply each vote by the voter's reputation
    #[serde(default)]
    pub weighted_voting: bool,

    /// Stop after this many committed turns (unbounded when absent)
    #[serde(default)]
    pub max_turns: Option<u64>,

    /// Suppression window for repeated reputation deltas
    #[serde(default = "default_reputation_cooldown_ms")]
    pub reputation_cooldown_ms: u64,
}

fn default_min_slice_ms() -> u64 {
    1500
}
fn default_max_turn_ms() -> u64 {
    5000
}
fn default_preempt_threshold() -> f64 {
    90.0
}
fn default_max_interrupt_depth() -> u32 {
    3
}
fn default_failure_trigger() -> u32 {
    3
}
fn default_quorum() -> f64 {
    0.66
}
fn default_interrupt_keywords() -> Vec<String> {
    ["urgent", "critical", "emergency", "important", "!!"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_reputation_cooldown_ms() -> u64 {
    10_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_slice_ms: default_min_slice_ms(),
            max_turn_ms: default_max_turn_ms(),
            preempt_threshold: default_preempt_threshold(),
            max_interrupt_depth: default_max_interrupt_depth(),
            failure_trigger: default_failure_trigger(),
            quorum_default: default_quorum(),
            interrupt_keywords: default_interrupt_keywords(),
            weighted_voting: false,
            max_turns: None,
            reputation_cooldown_ms: default_reputation_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatConfig {
    /// Tick length
    #[serde(default = "default_beat_duration_ms")]
    pub duration_ms: u64,

    /// Slot name -> slot index
    #[serde(default = "default_slots")]
    pub slots: HashMap<String, u8>,
}

fn default_beat_duration_ms() -> u64 {
    500
}

fn default_slots() -> HashMap<String, u8> {
    [
        ("housekeeping", 0u8),
        ("routing", 1),
        ("actions", 2),
        ("logging", 3),
        ("ping_window", 4),
    ]
    .into_iter()
    .map(|(name, idx)| (name.to_string(), idx))
    .collect()
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_beat_duration_ms(),
            slots: default_slots(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuorumConfig {
    /// Per-proposal-type voting rules
    #[serde(default)]
    pub rules: HashMap<String, QuorumRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumRule {
    /// Votes required out of `n` for k-of-n style reporting
    pub k: u32,
    pub n: u32,

    /// Approval fraction required
    pub threshold: f64,

    /// Votes that must be cast before any terminal tally
    pub minimum_participants: u32,

    /// Default voting window
    pub vote_timeout_sec: u64,
}

impl Config {
    /// Load configuration with the layered lookup. A missing file at a
    /// fallback location is fine; a present-but-invalid file is not.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let config = Self::from_file(path).await?;
            config.validate()?;
            return Ok(config);
        }

        let project = PathBuf::from("roundtable.json");
        if project.exists() {
            let config = Self::from_file(&project).await?;
            config.validate()?;
            return Ok(config);
        }

        if let Some(dirs) = ProjectDirs::from("com", "roundtable", "roundtable") {
            let user = dirs.config_dir().join("config.json");
            if user.exists() {
                let config = Self::from_file(&user).await?;
                config.validate()?;
                return Ok(config);
            }
        }

        Ok(Self::default())
    }

    async fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Startup-time validation. Errors here map to exit code 1.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                bail!("agent with empty id");
            }
            if agent.role.trim().is_empty() {
                bail!("agent '{}' is missing a role", agent.id);
            }
            if agent.endpoint.trim().is_empty() {
                bail!("agent '{}' is missing an endpoint", agent.id);
            }
            if agent.model.trim().is_empty() {
                bail!("agent '{}' is missing a model", agent.id);
            }
            if !seen.insert(agent.id.as_str()) {
                bail!("duplicate agent id '{}'", agent.id);
            }
            if let Some(weight) = agent.weight {
                if !(0.0..=1.0).contains(&weight) {
                    bail!("agent '{}' weight {} outside [0,1]", agent.id, weight);
                }
            }
        }

        for (group, members) in &self.groups {
            for member in members {
                if !seen.contains(member.as_str()) {
                    bail!("group '{group}' references unknown agent '{member}'");
                }
            }
        }

        for (agent, types) in &self.veto_powers {
            if !seen.contains(agent.as_str()) {
                bail!("veto powers reference unknown agent '{agent}'");
            }
            for proposal_type in types {
                if !self.quorum.rules.contains_key(proposal_type) {
                    bail!(
                        "veto powers for '{agent}' reference unknown proposal type '{proposal_type}'"
                    );
                }
            }
        }

        for (proposal_type, rule) in &self.quorum.rules {
            if !(rule.threshold > 0.0 && rule.threshold <= 1.0) {
                bail!(
                    "quorum rule '{proposal_type}' threshold {} outside (0,1]",
                    rule.threshold
                );
            }
            if rule.k > rule.n {
                bail!("quorum rule '{proposal_type}' has k > n");
            }
        }

        if !(self.scheduler.quorum_default > 0.0 && self.scheduler.quorum_default <= 1.0) {
            bail!(
                "scheduler.quorum_default {} outside (0,1]",
                self.scheduler.quorum_default
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> AgentSpec {
        AgentSpec {
            id: id.to_string(),
            role: "test".into(),
            endpoint: "http://localhost:11434".into(),
            model: "llama3".into(),
            system_prompt: None,
            weight: None,
            required: false,
            interrupt_keywords: Vec::new(),
            interrupt_threshold: None,
        }
    }

    fn rule() -> QuorumRule {
        QuorumRule {
            k: 2,
            n: 3,
            threshold: 0.66,
            minimum_participants: 3,
            vote_timeout_sec: 30,
        }
    }

    #[test]
    fn defaults_match_documented_knobs() {
        let config = Config::default();
        assert_eq!(config.scheduler.min_slice_ms, 1500);
        assert_eq!(config.scheduler.max_turn_ms, 5000);
        assert_eq!(config.scheduler.preempt_threshold, 90.0);
        assert_eq!(config.scheduler.max_interrupt_depth, 3);
        assert_eq!(config.scheduler.quorum_default, 0.66);
        assert!(config.scheduler.interrupt_keywords.contains(&"urgent".to_string()));
        assert_eq!(config.beat.duration_ms, 500);
        assert_eq!(config.beat.slots.get("routing"), Some(&1));
    }

    #[test]
    fn duplicate_agent_id_is_rejected() {
        let config = Config {
            agents: vec![spec("A"), spec("A")],
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate agent id"), "{err}");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut broken = spec("A");
        broken.endpoint = String::new();
        let config = Config {
            agents: vec![broken],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_veto_proposal_type_is_rejected() {
        let mut config = Config {
            agents: vec![spec("Sentinel")],
            ..Default::default()
        };
        config
            .veto_powers
            .insert("Sentinel".into(), vec!["shutdown".into()]);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unknown proposal type"), "{err}");

        // Declaring the rule makes the same veto map valid
        config.quorum.rules.insert("shutdown".into(), rule());
        config.validate().unwrap();
    }

    #[test]
    fn group_with_unknown_member_is_rejected() {
        let mut config = Config {
            agents: vec![spec("A")],
            ..Default::default()
        };
        config.groups.insert("ops".into(), vec!["Ghost".into()]);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unknown agent"), "{err}");
    }

    #[test]
    fn parses_full_document() {
        let json = r#"{
            "agents": [
                {"id": "Otto", "role": "orchestrator", "endpoint": "http://localhost:11434",
                 "model": "llama3", "system_prompt": "You are Otto.",
                 "interrupt_keywords": ["coordination"], "interrupt_threshold": 75}
            ],
            "groups": {"core": ["Otto"]},
            "templates": {"incident": "Respond to [SITUATION] about [TOPIC]"},
            "scheduler": {"min_slice_ms": 1000, "interrupt_keywords": ["urgent"]},
            "beat": {"duration_ms": 250},
            "quorum": {"rules": {"policy": {"k": 2, "n": 3, "threshold": 0.66,
                "minimum_participants": 3, "vote_timeout_sec": 30}}},
            "veto_powers": {"Otto": ["policy"]}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.scheduler.min_slice_ms, 1000);
        assert_eq!(config.scheduler.max_turn_ms, 5000);
        assert_eq!(config.agents[0].interrupt_threshold, Some(75));
    }
}

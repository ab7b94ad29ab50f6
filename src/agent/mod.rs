//! Agent handles and speak backends.
//!
//! An [`Agent`] is an opaque producer of text: given a prompt it returns
//! a reply or fails with a typed [`SpeakError`]. The scheduler is the
//! only caller of [`Agent::speak`] and guarantees at most one
//! outstanding call per agent. Backends are a tagged variant rather than
//! a trait hierarchy: remote HTTP endpoints, deterministic simulated
//! scripts for tests and offline runs, and arbitrary local callables.

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Cooperative cancellation signal handed to every `speak` call.
///
/// The scheduler flips the value to `true` when the slice is preempted
/// or the run stops; backends are expected to notice within a short
/// grace window.
pub type CancelSignal = watch::Receiver<bool>;

/// Create a cancellation pair. The sender side stays with the scheduler.
pub fn cancel_pair() -> (watch::Sender<bool>, CancelSignal) {
    watch::channel(false)
}

// ─── Errors ──────────────────────────────────────────────────────────────

/// The ways a speak call can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakError {
    /// The slice deadline elapsed before a reply arrived
    Timeout,
    /// The scheduler cancelled the in-flight call
    Cancelled,
    /// The transport to the agent failed (connection, I/O)
    Transport(String),
    /// The agent answered, but not in the expected shape
    Protocol(String),
}

impl std::fmt::Display for SpeakError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpeakError::Timeout => write!(f, "speak timed out"),
            SpeakError::Cancelled => write!(f, "speak cancelled"),
            SpeakError::Transport(detail) => write!(f, "transport failure: {detail}"),
            SpeakError::Protocol(detail) => write!(f, "protocol failure: {detail}"),
        }
    }
}

impl std::error::Error for SpeakError {}

/// Health as reported to external monitors. Never blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentHealth::Healthy => write!(f, "healthy"),
            AgentHealth::Unhealthy => write!(f, "unhealthy"),
            AgentHealth::Unknown => write!(f, "unknown"),
        }
    }
}

// ─── Backends ────────────────────────────────────────────────────────────

/// One step of a simulated agent's script.
#[derive(Debug, Clone)]
pub enum SimStep {
    /// Reply immediately with the given text
    Reply(String),
    /// Reply after a fixed delay (for slice-timing scenarios)
    DelayedReply { delay: Duration, text: String },
    /// Never reply; only a cancel or the slice deadline ends the call
    Hang,
    /// Fail with a protocol error
    Fail(String),
}

/// Scripted backend state. Steps are consumed in order and the script
/// wraps around once exhausted.
struct SimScript {
    steps: Vec<SimStep>,
    next: usize,
}

impl SimScript {
    fn advance(&mut self) -> SimStep {
        let step = self.steps[self.next % self.steps.len()].clone();
        self.next += 1;
        step
    }
}

/// Signature for the local-callable backend.
pub type SpeakFn =
    Arc<dyn Fn(String, CancelSignal) -> BoxFuture<'static, Result<String, SpeakError>> + Send + Sync>;

/// How an agent actually produces text.
pub enum AgentBackend {
    /// Remote model endpoint speaking the `/api/generate` protocol
    Endpoint {
        client: reqwest::Client,
        url: String,
        model: String,
        system_prompt: Option<String>,
    },
    /// Deterministic scripted replies
    Simulated { script: Mutex<SimScript> },
    /// Arbitrary local async callable
    Callable { speak: SpeakFn },
}

impl std::fmt::Debug for AgentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentBackend::Endpoint { url, model, .. } => f
                .debug_struct("Endpoint")
                .field("url", url)
                .field("model", model)
                .finish(),
            AgentBackend::Simulated { .. } => f.debug_struct("Simulated").finish(),
            AgentBackend::Callable { .. } => f.debug_struct("Callable").finish(),
        }
    }
}

/// Wire shape of the generate endpoint request.
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

// ─── Agent ───────────────────────────────────────────────────────────────

/// A registered participant in the conversation.
#[derive(Debug)]
pub struct Agent {
    handle: String,
    role: String,
    backend: AgentBackend,
    /// Substrings that make this agent auto-request an interrupt,
    /// on top of the scheduler-wide keyword set
    interrupt_keywords: Vec<String>,
    /// Floor for this agent's auto-interrupt priority
    interrupt_threshold: u8,
    /// Vote weight used in weighted ballots
    weight: f64,
    required: bool,
    alive: AtomicBool,
}

impl Agent {
    pub fn new(handle: impl Into<String>, role: impl Into<String>, backend: AgentBackend) -> Self {
        Self {
            handle: handle.into(),
            role: role.into(),
            backend,
            interrupt_keywords: Vec::new(),
            interrupt_threshold: 0,
            weight: 1.0,
            required: false,
            alive: AtomicBool::new(true),
        }
    }

    /// Agent speaking to a remote model endpoint, per its config entry.
    pub fn from_spec(spec: &crate::config::AgentSpec) -> Self {
        let backend = AgentBackend::Endpoint {
            client: reqwest::Client::new(),
            url: spec.endpoint.trim_end_matches('/').to_string(),
            model: spec.model.clone(),
            system_prompt: spec.system_prompt.clone(),
        };
        Self::new(spec.id.clone(), spec.role.clone(), backend)
            .with_keywords(
                spec.interrupt_keywords.clone(),
                spec.interrupt_threshold.unwrap_or(0),
            )
            .with_weight(spec.weight.unwrap_or(1.0))
            .with_required(spec.required)
    }

    /// Scripted stand-in for a config entry, for offline runs.
    pub fn simulated_from_spec(spec: &crate::config::AgentSpec) -> Self {
        let reply = format!("[{}] acknowledged", spec.role);
        Self::scripted(spec.id.clone(), vec![SimStep::Reply(reply)])
            .with_keywords(
                spec.interrupt_keywords.clone(),
                spec.interrupt_threshold.unwrap_or(0),
            )
            .with_weight(spec.weight.unwrap_or(1.0))
            .with_required(spec.required)
    }

    /// Simulated agent that always replies with the same text.
    pub fn simulated(handle: impl Into<String>, reply: impl Into<String>) -> Self {
        Self::scripted(handle, vec![SimStep::Reply(reply.into())])
    }

    /// Simulated agent driven by an explicit script.
    pub fn scripted(handle: impl Into<String>, steps: Vec<SimStep>) -> Self {
        assert!(!steps.is_empty(), "simulated script must have at least one step");
        Self::new(
            handle,
            "simulated",
            AgentBackend::Simulated {
                script: Mutex::new(SimScript { steps, next: 0 }),
            },
        )
    }

    pub fn with_keywords(mut self, keywords: Vec<String>, threshold: u8) -> Self {
        self.interrupt_keywords = keywords;
        self.interrupt_threshold = threshold.min(100);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight.clamp(0.0, 1.0);
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn interrupt_threshold(&self) -> u8 {
        self.interrupt_threshold
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    /// Does this agent's own keyword list match the text?
    pub fn keyword_match(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.interrupt_keywords
            .iter()
            .any(|kw| lowered.contains(&kw.to_lowercase()))
    }

    /// Non-blocking health snapshot.
    pub fn health(&self) -> AgentHealth {
        if !self.is_alive() {
            return AgentHealth::Unhealthy;
        }
        match &self.backend {
            // A remote endpoint's state is unknowable without a probe
            AgentBackend::Endpoint { .. } => AgentHealth::Unknown,
            AgentBackend::Simulated { .. } | AgentBackend::Callable { .. } => AgentHealth::Healthy,
        }
    }

    /// Produce a reply for the prompt, honoring the cancel signal.
    ///
    /// The deadline is enforced by the caller; this method only fails
    /// with `Timeout` when the backend itself gives up.
    pub async fn speak(&self, prompt: &str, cancel: CancelSignal) -> Result<String, SpeakError> {
        let started = Utc::now();
        let result = match &self.backend {
            AgentBackend::Endpoint {
                client,
                url,
                model,
                system_prompt,
            } => {
                self.speak_endpoint(client, url, model, system_prompt.as_deref(), prompt, cancel)
                    .await
            }
            AgentBackend::Simulated { script } => {
                let step = script.lock().advance();
                self.speak_simulated(step, cancel).await
            }
            AgentBackend::Callable { speak } => speak(prompt.to_string(), cancel).await,
        };
        tracing::debug!(
            agent = %self.handle,
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            ok = result.is_ok(),
            "speak finished"
        );
        result
    }

    async fn speak_endpoint(
        &self,
        client: &reqwest::Client,
        url: &str,
        model: &str,
        system_prompt: Option<&str>,
        prompt: &str,
        mut cancel: CancelSignal,
    ) -> Result<String, SpeakError> {
        let body = GenerateRequest {
            model,
            prompt,
            system: system_prompt,
            stream: false,
        };
        let request = client.post(format!("{url}/api/generate")).json(&body).send();

        tokio::select! {
            res = request => {
                let response = res.map_err(|e| SpeakError::Transport(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(SpeakError::Protocol(format!(
                        "endpoint returned {}",
                        response.status()
                    )));
                }
                let parsed: GenerateResponse = response
                    .json()
                    .await
                    .map_err(|e| SpeakError::Protocol(e.to_string()))?;
                parsed
                    .response
                    .ok_or_else(|| SpeakError::Protocol("missing `response` field".into()))
            }
            _ = wait_cancelled(&mut cancel) => Err(SpeakError::Cancelled),
        }
    }

    async fn speak_simulated(
        &self,
        step: SimStep,
        mut cancel: CancelSignal,
    ) -> Result<String, SpeakError> {
        match step {
            SimStep::Reply(text) => Ok(text),
            SimStep::DelayedReply { delay, text } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(text),
                    _ = wait_cancelled(&mut cancel) => Err(SpeakError::Cancelled),
                }
            }
            SimStep::Hang => {
                wait_cancelled(&mut cancel).await;
                Err(SpeakError::Cancelled)
            }
            SimStep::Fail(detail) => Err(SpeakError::Protocol(detail)),
        }
    }
}

/// Resolve once the cancel flag flips to `true` (or the sender is gone,
/// which means the scheduler abandoned the slice).
async fn wait_cancelled(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

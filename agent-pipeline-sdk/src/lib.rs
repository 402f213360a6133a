//! Collaborator contracts for the agent pipeline engine
//!
//! This crate holds everything that sits on the boundary between the engine and
//! the outside world:
//! - **AgentRunner / OutputValidator**: the two collaborators the engine drives
//! - **AgentInput / AgentOutput**: the fixed runner I/O contract
//! - **PipelineEvent / EventSink**: structured progress events for consumers
//!   (terminal, supervisors, UIs) plus the `emit_*!` helper macros

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

// Re-export async trait for convenience
pub use async_trait::async_trait;

/// Prefix marking a structured event line on stderr
pub const EVENT_PREFIX: &str = "__PIPELINE_EVENT__:";

// ============================================================================
// Agent Runner Contract
// ============================================================================

/// Input handed to an [`AgentRunner`] for one attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput {
    /// What the agent should do (resolved to a prompt by the runner)
    pub task_description: String,
    /// Shared workspace the agent operates in
    pub workspace_path: PathBuf,
    /// Extra context prepended to the task
    #[serde(default)]
    pub context_text: String,
    /// Environment variables set for this attempt only
    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
}

/// Result reported by an [`AgentRunner`] for one attempt
///
/// Failures are reported in-band (`success == false` with `error`), never as a
/// panic or a transport error, so the engine can classify them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optional structured error kind (e.g. `"AuthenticationError"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl AgentOutput {
    /// Successful attempt with result text
    pub fn succeeded(result_text: impl Into<String>, duration_ms: u64, cost_usd: f64) -> Self {
        Self {
            success: true,
            result_text: Some(result_text.into()),
            duration_ms,
            cost_usd,
            ..Default::default()
        }
    }

    /// Failed attempt with an error message
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_turns(mut self, turns: u32) -> Self {
        self.turns = Some(turns);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_error_kind(mut self, kind: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self
    }
}

/// Executes a single agent attempt
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, input: AgentInput) -> AgentOutput;
}

/// Checks the artifacts an agent attempt left behind
#[async_trait]
pub trait OutputValidator: Send + Sync {
    async fn validate(&self, agent_id: &str, workspace_path: &Path, result: &AgentOutput) -> bool;
}

/// Lifecycle status of a pipeline session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Running,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }
}

// ============================================================================
// Progress Events
// ============================================================================

/// Structured progress events emitted while a pipeline runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Phase started
    PhaseStarted { session_id: String, phase: String },
    /// Phase completed
    PhaseCompleted { session_id: String, phase: String },
    /// Agent attempt started
    AgentStarted { agent: String, attempt: u32 },
    /// Liveness signal from a running attempt
    Heartbeat {
        agent: String,
        attempt: u32,
        elapsed_secs: u64,
    },
    /// Attempt failed; `retryable` says whether another attempt follows
    AttemptFailed {
        agent: String,
        attempt: u32,
        error_kind: String,
        retryable: bool,
        message: String,
    },
    /// Agent finished successfully
    AgentCompleted {
        agent: String,
        attempt: u32,
        duration_ms: u64,
        cost_usd: f64,
    },
    /// Agent gave up
    AgentFailed { agent: String, error: String },
    /// Downstream gating decision for one sub-pipeline
    ExploitationDecided {
        work_type: String,
        should_exploit: bool,
        vulnerability_count: usize,
    },
    /// Sub-pipeline ended in failure (siblings keep running)
    SubPipelineFailed { work_type: String, error: String },
    /// Whole session finished
    SessionFinished {
        session_id: String,
        status: PipelineStatus,
        total_duration_ms: u64,
        total_cost_usd: f64,
    },
}

impl PipelineEvent {
    /// Render as a single stderr protocol line
    pub fn to_line(&self) -> Option<String> {
        serde_json::to_string(self)
            .ok()
            .map(|json| format!("{}{}", EVENT_PREFIX, json))
    }

    /// Parse a protocol line produced by [`PipelineEvent::to_line`]
    pub fn parse_line(line: &str) -> Option<Self> {
        let json = line.strip_prefix(EVENT_PREFIX)?;
        serde_json::from_str(json).ok()
    }
}

/// Destination for [`PipelineEvent`]s
///
/// Chosen once when the engine is built; [`NoopEventSink`] stands in when
/// nobody is listening.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Writes events to stderr as `__PIPELINE_EVENT__:<json>` lines
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrEventSink;

impl EventSink for StderrEventSink {
    fn emit(&self, event: PipelineEvent) {
        if let Some(line) = event.to_line() {
            use std::io::Write;
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            // Force flush stderr in async/concurrent contexts
            let _ = stderr.flush();
        }
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Fans events out to in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<PipelineEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

// ============================================================================
// Event Macros
// ============================================================================

#[macro_export]
macro_rules! emit_phase_started {
    ($sink:expr, $session:expr, $phase:expr) => {
        $sink.emit($crate::PipelineEvent::PhaseStarted {
            session_id: $session.to_string(),
            phase: $phase.to_string(),
        })
    };
}

#[macro_export]
macro_rules! emit_phase_completed {
    ($sink:expr, $session:expr, $phase:expr) => {
        $sink.emit($crate::PipelineEvent::PhaseCompleted {
            session_id: $session.to_string(),
            phase: $phase.to_string(),
        })
    };
}

#[macro_export]
macro_rules! emit_agent_started {
    ($sink:expr, $agent:expr, $attempt:expr) => {
        $sink.emit($crate::PipelineEvent::AgentStarted {
            agent: $agent.to_string(),
            attempt: $attempt,
        })
    };
}

#[macro_export]
macro_rules! emit_agent_completed {
    ($sink:expr, $agent:expr, $attempt:expr, $duration_ms:expr, $cost_usd:expr) => {
        $sink.emit($crate::PipelineEvent::AgentCompleted {
            agent: $agent.to_string(),
            attempt: $attempt,
            duration_ms: $duration_ms,
            cost_usd: $cost_usd,
        })
    };
}

#[macro_export]
macro_rules! emit_agent_failed {
    ($sink:expr, $agent:expr, $error:expr) => {
        $sink.emit($crate::PipelineEvent::AgentFailed {
            agent: $agent.to_string(),
            error: $error.to_string(),
        })
    };
}

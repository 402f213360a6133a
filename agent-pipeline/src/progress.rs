//! Live pipeline state and its read-only projection
//!
//! [`RunContext`] is the session-scoped writer threaded through the
//! orchestrator; [`ProgressHandle`] is the cloneable reader handed to
//! anyone who wants to poll progress while the pipeline runs.

use agent_pipeline_sdk::PipelineStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::agents::AgentName;
use crate::attempt::AttemptSuccess;

/// Metrics of one committed agent run, as seen by this process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunMetrics {
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub turns: Option<u32>,
    pub model: Option<String>,
}

impl From<&AttemptSuccess> for AgentRunMetrics {
    fn from(success: &AttemptSuccess) -> Self {
        Self {
            duration_ms: success.duration_ms,
            cost_usd: success.cost_usd,
            turns: success.turns,
            model: success.model.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub total_cost_usd: f64,
    /// Wall clock, end minus start
    pub total_duration_ms: u64,
    pub total_turns: u32,
    pub agent_count: usize,
}

/// Mutable state of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub status: PipelineStatus,
    pub current_phase: Option<String>,
    pub current_agent: Option<String>,
    pub completed_agents: Vec<AgentName>,
    pub failed_agent: Option<String>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub failed_pipelines: Vec<String>,
    pub agent_metrics: BTreeMap<String, AgentRunMetrics>,
    pub summary: Option<PipelineSummary>,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            status: PipelineStatus::Running,
            current_phase: None,
            current_agent: None,
            completed_agents: Vec::new(),
            failed_agent: None,
            error: None,
            start_time: Utc::now(),
            failed_pipelines: Vec::new(),
            agent_metrics: BTreeMap::new(),
            summary: None,
        }
    }
}

/// Point-in-time progress projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineProgress {
    pub session_id: String,
    pub status: PipelineStatus,
    pub current_phase: Option<String>,
    pub current_agent: Option<String>,
    pub completed_agents: Vec<AgentName>,
    pub failed_agent: Option<String>,
    pub error: Option<String>,
    pub failed_pipelines: Vec<String>,
    pub elapsed_ms: u64,
}

/// Read side of a run's state
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    session_id: String,
    started: Instant,
    state: Arc<RwLock<PipelineState>>,
}

impl ProgressHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn query(&self) -> PipelineProgress {
        let state = self.state.read().await;
        PipelineProgress {
            session_id: self.session_id.clone(),
            status: state.status,
            current_phase: state.current_phase.clone(),
            current_agent: state.current_agent.clone(),
            completed_agents: state.completed_agents.clone(),
            failed_agent: state.failed_agent.clone(),
            error: state.error.clone(),
            failed_pipelines: state.failed_pipelines.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Full copy of the underlying state
    pub async fn state(&self) -> PipelineState {
        self.state.read().await.clone()
    }
}

/// Session-scoped accumulators for one pipeline run
#[derive(Debug, Clone)]
pub struct RunContext {
    handle: ProgressHandle,
}

impl RunContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            handle: ProgressHandle {
                session_id: session_id.into(),
                started: Instant::now(),
                state: Arc::new(RwLock::new(PipelineState::new())),
            },
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn session_id(&self) -> &str {
        self.handle.session_id()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.handle.started.elapsed().as_millis() as u64
    }

    pub async fn enter(&self, phase: &str, agent: Option<&str>) {
        let mut state = self.handle.state.write().await;
        state.current_phase = Some(phase.to_string());
        state.current_agent = agent.map(str::to_string);
    }

    pub async fn set_current_agent(&self, agent: Option<&str>) {
        self.handle.state.write().await.current_agent = agent.map(str::to_string);
    }

    /// Record a committed agent, with metrics when it ran in this process
    pub async fn record_completed(&self, agent: AgentName, metrics: Option<AgentRunMetrics>) {
        let mut state = self.handle.state.write().await;
        if !state.completed_agents.contains(&agent) {
            state.completed_agents.push(agent);
        }
        if let Some(metrics) = metrics {
            state.agent_metrics.insert(agent.to_string(), metrics);
        }
    }

    pub async fn record_failed_pipeline(&self, message: impl Into<String>) {
        self.handle
            .state
            .write()
            .await
            .failed_pipelines
            .push(message.into());
    }

    pub async fn is_completed(&self, agent: AgentName) -> bool {
        self.handle
            .state
            .read()
            .await
            .completed_agents
            .contains(&agent)
    }

    /// Mark the run completed and freeze its summary
    pub async fn complete(&self) -> PipelineSummary {
        let elapsed = self.elapsed_ms();
        let mut state = self.handle.state.write().await;
        state.status = PipelineStatus::Completed;
        state.current_phase = None;
        state.current_agent = None;
        let summary = summarize(&state, elapsed);
        state.summary = Some(summary);
        summary
    }

    /// Mark the run failed, blaming the agent that was current
    pub async fn fail(&self, error: impl Into<String>) -> PipelineSummary {
        let elapsed = self.elapsed_ms();
        let mut state = self.handle.state.write().await;
        state.status = PipelineStatus::Failed;
        state.failed_agent = state.current_agent.clone();
        state.error = Some(error.into());
        let summary = summarize(&state, elapsed);
        state.summary = Some(summary);
        summary
    }

    pub async fn state(&self) -> PipelineState {
        self.handle.state().await
    }
}

fn summarize(state: &PipelineState, elapsed_ms: u64) -> PipelineSummary {
    PipelineSummary {
        total_cost_usd: state.agent_metrics.values().map(|m| m.cost_usd).sum(),
        total_duration_ms: elapsed_ms,
        total_turns: state
            .agent_metrics
            .values()
            .map(|m| m.turns.unwrap_or(0))
            .sum(),
        agent_count: state.completed_agents.len(),
    }
}

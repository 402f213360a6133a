//! Pipeline orchestrator
//!
//! Drives one session through its phases:
//!
//! ```text
//! pre-recon → recon → ┬ injection-vuln → gate → injection-exploit ┬ → report
//!                     ├ xss-vuln       → gate → xss-exploit       ┤
//!                     ├ auth-vuln      → gate → auth-exploit      ┤
//!                     ├ ssrf-vuln      → gate → ssrf-exploit      ┤
//!                     └ authz-vuln     → gate → authz-exploit     ┘
//! ```
//!
//! Sequential phases abort the session on failure. The five sub-pipelines
//! run concurrently and independently; a failing sub-pipeline is recorded
//! and its siblings carry on.
//!
//! # Example
//! ```rust,ignore
//! let orchestrator = PipelineOrchestrator::new(config, runner, validator)
//!     .with_event_sink(Arc::new(StderrEventSink));
//! let run = orchestrator.prepare(input).await?;
//! let progress = run.progress();
//! let outcome = run.execute().await?;
//! ```

use agent_pipeline_sdk::{
    emit_agent_failed, emit_phase_completed, emit_phase_started, AgentInput, AgentRunner,
    EventSink, NoopEventSink, OutputValidator, PipelineEvent, PipelineStatus,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::{AgentName, PhaseName, VulnType};
use crate::attempt::{AttemptController, AttemptError, AttemptSettings, AttemptSuccess};
use crate::audit::{
    AgentSummaryLine, AuditSink, FileAuditSink, NoopAuditSink, PhaseEvent, WorkflowSummary,
};
use crate::batch::{execute_settled, TaskContext};
use crate::checkpoint::{GitCheckpointer, WorkspaceCheckpointer};
use crate::classifier::{BackoffPolicy, ExponentialBackoff};
use crate::config::PipelineConfig;
use crate::gate::{ExploitationDecision, GateError, QueueValidationGate};
use crate::metrics::{AgentStatus, MetricsError, SessionInfo, SessionMetricsStore, SESSION_FILE};
use crate::progress::{AgentRunMetrics, PipelineState, PipelineSummary, ProgressHandle, RunContext};
use crate::report::{assemble_final_report, inject_model_metadata};

/// Progress label of the concurrent vuln→exploit phase
pub const FAN_OUT_PHASE: &str = "vulnerability-exploitation";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Session {0} already exists; resume it instead")]
    SessionExists(String),

    #[error("{agent} cannot run before {missing} has completed")]
    MissingPrerequisite { agent: AgentName, missing: AgentName },

    #[error(transparent)]
    Attempt(#[from] AttemptError),

    #[error("Exploitation gate for {work_type} gave up after {attempts} checks: {source}")]
    Gate {
        work_type: VulnType,
        attempts: u32,
        #[source]
        source: GateError,
    },

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// What to run and where
#[derive(Debug, Clone, Default)]
pub struct PipelineInput {
    pub target: String,
    pub workspace: PathBuf,
    /// Generated when absent
    pub session_id: Option<String>,
    /// Continue an existing session, skipping agents that already succeeded
    pub resume: bool,
    /// Use the short testing retry preset
    pub testing: bool,
}

/// Result of one vuln→exploit sub-pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct SubPipelineResult {
    pub work_type: VulnType,
    pub vuln: Option<AgentRunMetrics>,
    pub exploit: Option<AgentRunMetrics>,
    /// `None` when the gate failed non-retryably and exploitation was skipped
    pub decision: Option<ExploitationDecision>,
}

/// Final state of a session run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub session_id: String,
    pub status: PipelineStatus,
    pub summary: PipelineSummary,
    pub state: PipelineState,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Builds session runs from long-lived collaborators
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    runner: Arc<dyn AgentRunner>,
    validator: Arc<dyn OutputValidator>,
    events: Arc<dyn EventSink>,
    checkpointer: Option<Arc<dyn WorkspaceCheckpointer>>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
    audit_log: bool,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn AgentRunner>,
        validator: Arc<dyn OutputValidator>,
    ) -> Self {
        Self {
            config,
            runner,
            validator,
            events: Arc::new(NoopEventSink),
            checkpointer: None,
            backoff: None,
            audit_log: true,
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replace the git checkpointer built from the workspace
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn WorkspaceCheckpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Replace the profile-driven exponential backoff
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Skip `workflow.log` and the per-attempt logs
    pub fn without_audit_log(mut self) -> Self {
        self.audit_log = false;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Open (or resume) the session and wire every component for one run
    pub async fn prepare(&self, input: PipelineInput) -> Result<PipelineRun, PipelineError> {
        let config = if input.testing {
            self.config.clone().testing()
        } else {
            self.config.clone()
        };
        let audit_root = config.resolved_audit_root();
        let session_id = input
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let document_path = audit_root.join(&session_id).join(SESSION_FILE);
        let exists = tokio::fs::try_exists(&document_path).await.unwrap_or(false);
        if exists && !input.resume {
            return Err(PipelineError::SessionExists(session_id));
        }

        let metrics = Arc::new(
            SessionMetricsStore::open(
                &audit_root,
                SessionInfo {
                    id: session_id.clone(),
                    target: input.target.clone(),
                },
            )
            .await?,
        );
        if input.resume && metrics.snapshot().await.session.status.is_terminal() {
            metrics.reopen().await?;
        }

        let audit: Arc<dyn AuditSink> = if self.audit_log {
            Arc::new(FileAuditSink::new(&audit_root, &session_id, &input.target))
        } else {
            Arc::new(NoopAuditSink)
        };

        let checkpointer = match &self.checkpointer {
            Some(checkpointer) => checkpointer.clone(),
            None => Arc::new(
                GitCheckpointer::new(&input.workspace)
                    .with_lock_retries(config.git_lock_retries, config.git_lock_base_delay())
                    .with_identity(config.commit_identity.clone()),
            ),
        };

        let backoff = match &self.backoff {
            Some(backoff) => backoff.clone(),
            None => Arc::new(ExponentialBackoff::from_profile(&config.retry_profile())),
        };

        let controller = AttemptController::new(
            self.runner.clone(),
            self.validator.clone(),
            checkpointer,
            metrics.clone(),
            audit.clone(),
            self.events.clone(),
            AttemptSettings::from_config(&config),
        );

        let ctx = RunContext::new(session_id.clone());
        if input.resume {
            for agent in metrics.snapshot().await.completed_agents() {
                ctx.record_completed(agent, None).await;
            }
        }

        info!(
            session = %session_id,
            target = %input.target,
            resume = input.resume,
            "Session prepared"
        );

        Ok(PipelineRun {
            input,
            config,
            session_id,
            controller,
            metrics,
            audit,
            events: self.events.clone(),
            backoff,
            ctx,
        })
    }

    /// Prepare and execute in one go
    pub async fn run(&self, input: PipelineInput) -> Result<PipelineOutcome, PipelineError> {
        self.prepare(input).await?.execute().await
    }
}

// ============================================================================
// Session Run
// ============================================================================

/// One prepared session, ready to execute
pub struct PipelineRun {
    input: PipelineInput,
    config: PipelineConfig,
    session_id: String,
    controller: AttemptController,
    metrics: Arc<SessionMetricsStore>,
    audit: Arc<dyn AuditSink>,
    events: Arc<dyn EventSink>,
    backoff: Arc<dyn BackoffPolicy>,
    ctx: RunContext,
}

impl PipelineRun {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Live progress, queryable while [`PipelineRun::execute`] runs
    pub fn progress(&self) -> ProgressHandle {
        self.ctx.handle()
    }

    pub fn metrics(&self) -> Arc<SessionMetricsStore> {
        self.metrics.clone()
    }

    /// Run every phase and settle the session status
    ///
    /// A failed session is still an `Ok` outcome with `status == Failed`;
    /// `Err` means the session bookkeeping itself broke.
    pub async fn execute(self) -> Result<PipelineOutcome, PipelineError> {
        info!(session = %self.session_id, target = %self.input.target, "Pipeline started");

        let result = self.run_phases().await;

        let (status, summary, error) = match result {
            Ok(()) => {
                let summary = self.ctx.complete().await;
                (PipelineStatus::Completed, summary, None)
            }
            Err(e) => {
                let message = e.to_string();
                error!(session = %self.session_id, "Pipeline failed: {}", message);
                let summary = self.ctx.fail(message.clone()).await;
                (PipelineStatus::Failed, summary, Some(message))
            }
        };

        self.metrics.update_session_status(status).await?;

        let state = self.ctx.state().await;
        self.audit
            .log_workflow_complete(&WorkflowSummary {
                status,
                total_duration_ms: summary.total_duration_ms,
                total_cost_usd: summary.total_cost_usd,
                agents: state
                    .completed_agents
                    .iter()
                    .map(|agent| {
                        let metrics = state.agent_metrics.get(agent.as_str());
                        AgentSummaryLine {
                            agent: *agent,
                            duration_ms: metrics.map(|m| m.duration_ms).unwrap_or(0),
                            cost_usd: metrics.map(|m| m.cost_usd).unwrap_or(0.0),
                        }
                    })
                    .collect(),
                error,
            })
            .await;
        self.events.emit(PipelineEvent::SessionFinished {
            session_id: self.session_id.clone(),
            status,
            total_duration_ms: summary.total_duration_ms,
            total_cost_usd: summary.total_cost_usd,
        });
        info!(
            session = %self.session_id,
            status = status.as_str(),
            cost_usd = summary.total_cost_usd,
            agents = summary.agent_count,
            "Pipeline finished"
        );

        Ok(PipelineOutcome {
            session_id: self.session_id,
            status,
            summary,
            state,
        })
    }

    async fn run_phases(&self) -> Result<(), PipelineError> {
        self.run_sequential(AgentName::PreRecon).await?;
        self.run_sequential(AgentName::Recon).await?;
        self.run_fan_out().await;
        self.run_reporting().await
    }

    async fn begin_phase(&self, phase: PhaseName) {
        self.audit.log_phase(phase, PhaseEvent::Start).await;
        emit_phase_started!(self.events, self.session_id, phase);
    }

    async fn end_phase(&self, phase: PhaseName) {
        self.audit.log_phase(phase, PhaseEvent::Complete).await;
        emit_phase_completed!(self.events, self.session_id, phase);
    }

    /// One agent as its own phase; any failure aborts the session
    async fn run_sequential(&self, agent: AgentName) -> Result<(), PipelineError> {
        let phase = agent.phase();
        self.ctx.enter(phase.as_str(), Some(agent.as_str())).await;

        if self.ctx.is_completed(agent).await {
            info!(%agent, "Already completed, skipping");
            return Ok(());
        }

        self.begin_phase(phase).await;
        self.run_agent(agent).await?;
        self.end_phase(phase).await;
        Ok(())
    }

    async fn run_fan_out(&self) {
        self.ctx.enter(FAN_OUT_PHASE, Some("pipelines")).await;
        self.begin_phase(PhaseName::VulnerabilityAnalysis).await;
        self.begin_phase(PhaseName::Exploitation).await;

        let outcomes = execute_settled(
            VulnType::ALL.to_vec(),
            self.config.max_parallel_pipelines,
            |work_type, task| self.run_sub_pipeline(work_type, task),
        )
        .await;

        for (work_type, outcome) in VulnType::ALL.iter().zip(outcomes) {
            if let Err(e) = outcome {
                let message = e.to_string();
                warn!(%work_type, "Sub-pipeline failed: {}", message);
                let line = format!("{} sub-pipeline failed: {}", work_type, message);
                self.audit.log_event("pipeline", &line).await;
                self.ctx.record_failed_pipeline(message.clone()).await;
                self.events.emit(PipelineEvent::SubPipelineFailed {
                    work_type: work_type.to_string(),
                    error: message,
                });
            }
        }

        let failed = self.ctx.state().await.failed_pipelines.len();
        if failed > 0 {
            warn!(failed, "Some sub-pipelines failed; continuing to reporting");
        }

        self.ctx.set_current_agent(None).await;
        self.end_phase(PhaseName::VulnerabilityAnalysis).await;
        self.end_phase(PhaseName::Exploitation).await;
    }

    /// vuln agent → gate → exploit agent when the queue has items
    async fn run_sub_pipeline(
        &self,
        work_type: VulnType,
        task: TaskContext,
    ) -> Result<SubPipelineResult, PipelineError> {
        debug!(
            %work_type,
            task = task.task_number,
            total = task.total_tasks,
            "Sub-pipeline started"
        );

        let vuln = self.run_agent(work_type.vuln_agent()).await?;

        let decision = match self.gate_decision(work_type).await {
            Ok(decision) => decision,
            Err(PipelineError::Gate { source, .. }) if !source.is_retryable() => {
                warn!(%work_type, "Skipping exploitation: {}", source);
                let line = format!("{}: skipping exploitation: {}", work_type, source);
                self.audit.log_event("gate", &line).await;
                return Ok(SubPipelineResult {
                    work_type,
                    vuln,
                    exploit: None,
                    decision: None,
                });
            }
            Err(e) => return Err(e),
        };
        self.audit
            .log_event(
                "gate",
                &format!(
                    "{}: {} ({} vulnerabilities queued)",
                    work_type,
                    if decision.should_exploit {
                        "exploit"
                    } else {
                        "skip exploitation"
                    },
                    decision.vulnerability_count
                ),
            )
            .await;
        self.events.emit(PipelineEvent::ExploitationDecided {
            work_type: work_type.to_string(),
            should_exploit: decision.should_exploit,
            vulnerability_count: decision.vulnerability_count,
        });

        let exploit = if decision.should_exploit {
            self.run_agent(work_type.exploit_agent()).await?
        } else {
            info!(%work_type, "No vulnerabilities queued, skipping exploitation");
            None
        };

        Ok(SubPipelineResult {
            work_type,
            vuln,
            exploit,
            decision: Some(decision),
        })
    }

    /// Gate check, re-checking retryable errors with backoff
    async fn gate_decision(
        &self,
        work_type: VulnType,
    ) -> Result<ExploitationDecision, PipelineError> {
        let attempts = self.config.gate_attempts.max(1);
        let mut check = 1;
        loop {
            match QueueValidationGate::decide(work_type, &self.input.workspace).await {
                Ok(decision) => {
                    info!(
                        %work_type,
                        should_exploit = decision.should_exploit,
                        count = decision.vulnerability_count,
                        "Exploitation decision"
                    );
                    return Ok(decision);
                }
                Err(source) if source.is_retryable() && check < attempts => {
                    let delay = self.backoff.delay(&source.to_classified(), check);
                    warn!(%work_type, check, "Gate check failed, re-checking: {}", source);
                    tokio::time::sleep(delay).await;
                    check += 1;
                }
                Err(source) => {
                    return Err(PipelineError::Gate {
                        work_type,
                        attempts: check,
                        source,
                    })
                }
            }
        }
    }

    async fn run_reporting(&self) -> Result<(), PipelineError> {
        let agent = AgentName::Report;
        self.ctx
            .enter(PhaseName::Reporting.as_str(), Some(agent.as_str()))
            .await;
        if self.ctx.is_completed(agent).await {
            info!(%agent, "Already completed, skipping");
            return Ok(());
        }

        self.begin_phase(PhaseName::Reporting).await;

        let mut missing = Vec::new();
        for prerequisite in agent.prerequisites() {
            if !self.ctx.is_completed(prerequisite).await {
                missing.push(prerequisite.as_str());
            }
        }
        if !missing.is_empty() {
            info!(
                missing = %missing.join(", "),
                "Reporting without evidence from every exploit agent"
            );
        }

        if let Err(e) = assemble_final_report(&self.input.workspace).await {
            warn!("Report assembly failed: {:#}", e);
        }

        self.run_agent(agent).await?;

        let document = self.metrics.snapshot().await;
        if let Err(e) = inject_model_metadata(&self.input.workspace, &document).await {
            warn!("Report metadata injection failed: {:#}", e);
        }

        self.end_phase(PhaseName::Reporting).await;
        Ok(())
    }

    /// Run one agent through the attempt controller and record the result
    ///
    /// `Ok(None)` when the agent had already succeeded in this session.
    async fn run_agent(&self, agent: AgentName) -> Result<Option<AgentRunMetrics>, PipelineError> {
        if self.ctx.is_completed(agent).await {
            info!(%agent, "Already completed, skipping");
            return Ok(None);
        }
        if agent != AgentName::Report {
            for prerequisite in agent.prerequisites() {
                if !self.ctx.is_completed(prerequisite).await {
                    return Err(PipelineError::MissingPrerequisite {
                        agent,
                        missing: prerequisite,
                    });
                }
            }
        }

        let document = self.metrics.reload().await?;
        if document.agent(agent).map(|m| m.status) == Some(AgentStatus::Success) {
            info!(%agent, "Completed by another process sharing this session");
            self.ctx.record_completed(agent, None).await;
            return Ok(None);
        }

        match self
            .controller
            .run_with_retry(agent, self.agent_input(agent), self.backoff.as_ref())
            .await
        {
            Ok(success) => {
                self.record_success(&success).await;
                Ok(Some(AgentRunMetrics::from(&success)))
            }
            Err(e) => {
                emit_agent_failed!(self.events, agent, e);
                Err(e.into())
            }
        }
    }

    async fn record_success(&self, success: &AttemptSuccess) {
        self.ctx
            .record_completed(success.agent, Some(AgentRunMetrics::from(success)))
            .await;
    }

    fn agent_input(&self, agent: AgentName) -> AgentInput {
        let mut env_overrides = HashMap::new();
        env_overrides.insert("PIPELINE_SESSION_ID".to_string(), self.session_id.clone());
        env_overrides.insert("PIPELINE_AGENT".to_string(), agent.to_string());
        env_overrides.insert("PIPELINE_TARGET".to_string(), self.input.target.clone());

        AgentInput {
            task_description: agent.prompt_name().to_string(),
            workspace_path: self.input.workspace.clone(),
            context_text: format!("{} against {}", agent.display_name(), self.input.target),
            env_overrides,
        }
    }
}

//! Attempt controller
//!
//! Wraps every runner invocation of one agent in the same sequence:
//!
//! ```text
//! Pending → Checkpointed → Executing ─┬─ ValidatingOutput → Committed
//!                                     └─ RollingBack → Pending (retry) | Failed
//! ```
//!
//! Attempts of one agent are strictly sequential. Each attempt reserves its
//! number from the metrics store and records exactly one `end_attempt`.

use agent_pipeline_sdk::{
    emit_agent_completed, emit_agent_started, AgentInput, AgentOutput, AgentRunner, EventSink,
    OutputValidator, PipelineEvent,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::agents::AgentName;
use crate::audit::{AgentEndDetails, AttemptLog, AuditSink};
use crate::checkpoint::{CheckpointTag, WorkspaceCheckpointer};
use crate::classifier::{
    classify_output, looks_like_spending_cap, BackoffPolicy, ClassifiedError, ClassifierPolicy,
    ErrorKind,
};
use crate::config::PipelineConfig;
use crate::metrics::{AttemptResult, MetricsError, SessionMetricsStore};

/// Per-agent retry limits and timing
#[derive(Debug, Clone)]
pub struct AttemptSettings {
    pub max_attempts: u32,
    pub max_output_validation_attempts: u32,
    pub attempt_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub classifier: ClassifierPolicy,
}

impl AttemptSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let profile = config.retry_profile();
        Self {
            max_attempts: profile.max_attempts.max(1),
            max_output_validation_attempts: config.max_output_validation_attempts.max(1),
            attempt_timeout: profile.attempt_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            classifier: config.classifier_policy(),
        }
    }
}

impl Default for AttemptSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Committed result of an agent
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSuccess {
    pub agent: AgentName,
    pub attempt_number: u32,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub turns: Option<u32>,
    pub model: Option<String>,
    pub checkpoint: Option<String>,
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("{agent} failed on attempt {attempts} with a non-retryable error: {error}")]
    NonRetryable {
        agent: AgentName,
        attempts: u32,
        error: ClassifiedError,
    },

    #[error("{agent} exhausted {attempts} attempts: {error}")]
    RetriesExhausted {
        agent: AgentName,
        attempts: u32,
        error: ClassifiedError,
    },

    #[error("{agent} failed output validation after {attempts} attempts")]
    ValidationExhausted {
        agent: AgentName,
        attempts: u32,
        error: ClassifiedError,
    },

    #[error("Metrics store error for {agent}: {source}")]
    Metrics {
        agent: AgentName,
        attempts: u32,
        #[source]
        source: MetricsError,
    },
}

impl AttemptError {
    pub fn agent(&self) -> AgentName {
        match self {
            AttemptError::NonRetryable { agent, .. }
            | AttemptError::RetriesExhausted { agent, .. }
            | AttemptError::ValidationExhausted { agent, .. }
            | AttemptError::Metrics { agent, .. } => *agent,
        }
    }

    /// Attempts consumed in this run
    pub fn attempts(&self) -> u32 {
        match self {
            AttemptError::NonRetryable { attempts, .. }
            | AttemptError::RetriesExhausted { attempts, .. }
            | AttemptError::ValidationExhausted { attempts, .. }
            | AttemptError::Metrics { attempts, .. } => *attempts,
        }
    }

    /// Failure in the engine-wide taxonomy
    pub fn classified(&self) -> ClassifiedError {
        match self {
            AttemptError::NonRetryable { error, .. }
            | AttemptError::RetriesExhausted { error, .. }
            | AttemptError::ValidationExhausted { error, .. } => error.clone(),
            AttemptError::Metrics { source, .. } => {
                ClassifiedError::of_kind(ErrorKind::Configuration, source.to_string())
            }
        }
    }
}

/// One attempt's outcome before bookkeeping
enum Outcome {
    Passed(AgentOutput),
    Failed {
        error: ClassifiedError,
        duration_ms: u64,
        cost_usd: f64,
        model: Option<String>,
    },
}

pub struct AttemptController {
    runner: Arc<dyn AgentRunner>,
    validator: Arc<dyn OutputValidator>,
    checkpointer: Arc<dyn WorkspaceCheckpointer>,
    metrics: Arc<SessionMetricsStore>,
    audit: Arc<dyn AuditSink>,
    events: Arc<dyn EventSink>,
    settings: AttemptSettings,
}

impl AttemptController {
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        validator: Arc<dyn OutputValidator>,
        checkpointer: Arc<dyn WorkspaceCheckpointer>,
        metrics: Arc<SessionMetricsStore>,
        audit: Arc<dyn AuditSink>,
        events: Arc<dyn EventSink>,
        settings: AttemptSettings,
    ) -> Self {
        Self {
            runner,
            validator,
            checkpointer,
            metrics,
            audit,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &AttemptSettings {
        &self.settings
    }

    /// Run `agent` until it commits, fails non-retryably, or exhausts its budgets
    pub async fn run_with_retry(
        &self,
        agent: AgentName,
        input: AgentInput,
        backoff: &dyn BackoffPolicy,
    ) -> Result<AttemptSuccess, AttemptError> {
        let max_attempts = self.settings.max_attempts;
        let mut validation_failures = 0u32;

        for local_attempt in 1..=max_attempts {
            let attempt_number =
                self.metrics
                    .start_attempt(agent)
                    .await
                    .map_err(|source| AttemptError::Metrics {
                        agent,
                        attempts: local_attempt - 1,
                        source,
                    })?;

            self.audit.log_agent_start(agent, attempt_number).await;
            emit_agent_started!(self.events, agent, attempt_number);
            let mut log = self.audit.open_attempt(agent, attempt_number).await;
            log.log_event(
                "agent_start",
                json!({
                    "agent": agent,
                    "attempt": attempt_number,
                    "task": input.task_description,
                }),
            )
            .await;

            // Checkpoint failures are not fatal to the attempt
            let tag = CheckpointTag::new(agent.as_str(), local_attempt);
            if let Err(e) = self.checkpointer.checkpoint(&tag).await {
                warn!(%agent, attempt = attempt_number, "Checkpoint failed, continuing: {}", e);
            }

            let outcome = match self.execute(agent, attempt_number, input.clone(), &mut log).await {
                Ok(output) => self.judge(agent, &input.workspace_path, output).await,
                Err(outcome) => outcome,
            };

            match outcome {
                Outcome::Passed(output) => {
                    return self
                        .commit_success(agent, attempt_number, local_attempt, output, log)
                        .await;
                }
                Outcome::Failed {
                    error,
                    duration_ms,
                    cost_usd,
                    model,
                } => {
                    if error.kind == ErrorKind::OutputValidationFailure {
                        validation_failures += 1;
                    }
                    let validation_exhausted = error.kind == ErrorKind::OutputValidationFailure
                        && (validation_failures >= self.settings.max_output_validation_attempts
                            || local_attempt == max_attempts);
                    let is_final =
                        !error.retryable || local_attempt == max_attempts || validation_exhausted;

                    if let Err(e) = self.checkpointer.rollback(error.kind.as_str()).await {
                        warn!(%agent, "Rollback after failed attempt failed: {}", e);
                    }

                    self.metrics
                        .end_attempt(
                            agent,
                            AttemptResult {
                                attempt_number,
                                duration_ms,
                                cost_usd,
                                success: false,
                                model,
                                error: Some(error.message.clone()),
                                checkpoint: None,
                                is_final_attempt: is_final,
                            },
                        )
                        .await
                        .map_err(|source| AttemptError::Metrics {
                            agent,
                            attempts: local_attempt,
                            source,
                        })?;

                    log.log_event(
                        "agent_end",
                        json!({
                            "success": false,
                            "durationMs": duration_ms,
                            "costUsd": cost_usd,
                            "errorKind": error.kind.as_str(),
                            "retryable": error.retryable,
                            "error": error.message,
                        }),
                    )
                    .await;
                    self.audit
                        .log_agent_end(
                            agent,
                            &AgentEndDetails {
                                attempt: attempt_number,
                                success: false,
                                duration_ms,
                                cost_usd,
                                error: Some(error.message.clone()),
                            },
                        )
                        .await;
                    self.events.emit(PipelineEvent::AttemptFailed {
                        agent: agent.to_string(),
                        attempt: attempt_number,
                        error_kind: error.kind.as_str().to_string(),
                        retryable: !is_final,
                        message: error.message.clone(),
                    });

                    if !error.retryable {
                        warn!(%agent, attempt = attempt_number, kind = %error.kind, "Non-retryable failure");
                        return Err(AttemptError::NonRetryable {
                            agent,
                            attempts: local_attempt,
                            error,
                        });
                    }
                    if validation_exhausted {
                        return Err(AttemptError::ValidationExhausted {
                            agent,
                            attempts: local_attempt,
                            error,
                        });
                    }
                    if local_attempt == max_attempts {
                        return Err(AttemptError::RetriesExhausted {
                            agent,
                            attempts: local_attempt,
                            error,
                        });
                    }

                    let delay = backoff.delay(&error, local_attempt);
                    info!(
                        %agent,
                        attempt = attempt_number,
                        kind = %error.kind,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // max_attempts >= 1 so the loop always returns
        Err(AttemptError::RetriesExhausted {
            agent,
            attempts: max_attempts,
            error: ClassifiedError::of_kind(ErrorKind::ExecutionLimit, "No attempts permitted"),
        })
    }

    /// Invoke the runner under the wall-clock ceiling, heartbeating meanwhile
    async fn execute(
        &self,
        agent: AgentName,
        attempt: u32,
        input: AgentInput,
        log: &mut Box<dyn AttemptLog>,
    ) -> Result<AgentOutput, Outcome> {
        let started = Instant::now();
        let run = self.runner.run(input);
        tokio::pin!(run);

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        // First tick completes immediately
        heartbeat.tick().await;

        let limit = self.settings.attempt_timeout;
        let timed = tokio::time::timeout(limit, async {
            loop {
                tokio::select! {
                    output = &mut run => break output,
                    _ = heartbeat.tick() => {
                        let elapsed_secs = started.elapsed().as_secs();
                        self.events.emit(PipelineEvent::Heartbeat {
                            agent: agent.to_string(),
                            attempt,
                            elapsed_secs,
                        });
                        log.log_event("heartbeat", json!({ "elapsedSecs": elapsed_secs })).await;
                    }
                }
            }
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match timed {
            Ok(mut output) => {
                if output.duration_ms == 0 {
                    output.duration_ms = elapsed_ms;
                }
                Ok(output)
            }
            Err(_) => Err(Outcome::Failed {
                error: ClassifiedError::of_kind(
                    ErrorKind::ExecutionLimit,
                    format!(
                        "Agent {} exceeded execution limit of {}s",
                        agent,
                        limit.as_secs_f64()
                    ),
                ),
                duration_ms: elapsed_ms,
                cost_usd: 0.0,
                model: None,
            }),
        }
    }

    /// Classify a finished run: billing guard, runner failure, then validation
    async fn judge(&self, agent: AgentName, workspace: &Path, output: AgentOutput) -> Outcome {
        if looks_like_spending_cap(&output) {
            let text: String = output
                .result_text
                .as_deref()
                .unwrap_or("")
                .chars()
                .take(100)
                .collect();
            return Outcome::Failed {
                error: ClassifiedError::of_kind(
                    ErrorKind::BillingOrQuota,
                    format!("Spending cap likely reached: {}", text),
                ),
                duration_ms: output.duration_ms,
                cost_usd: 0.0,
                model: output.model,
            };
        }

        if !output.success {
            return Outcome::Failed {
                error: classify_output(&output, &self.settings.classifier),
                duration_ms: output.duration_ms,
                cost_usd: output.cost_usd,
                model: output.model,
            };
        }

        if self
            .validator
            .validate(agent.as_str(), workspace, &output)
            .await
        {
            return Outcome::Passed(output);
        }

        Outcome::Failed {
            error: ClassifiedError::of_kind(
                ErrorKind::OutputValidationFailure,
                format!("Agent {} failed output validation", agent),
            ),
            duration_ms: output.duration_ms,
            cost_usd: output.cost_usd,
            model: output.model,
        }
    }

    async fn commit_success(
        &self,
        agent: AgentName,
        attempt_number: u32,
        local_attempt: u32,
        output: AgentOutput,
        mut log: Box<dyn AttemptLog>,
    ) -> Result<AttemptSuccess, AttemptError> {
        let tag = CheckpointTag::new(agent.as_str(), local_attempt);
        if let Err(e) = self.checkpointer.commit(&tag).await {
            warn!(%agent, "Commit after success failed: {}", e);
        }
        let checkpoint = self.checkpointer.head().await;

        self.metrics
            .end_attempt(
                agent,
                AttemptResult {
                    attempt_number,
                    duration_ms: output.duration_ms,
                    cost_usd: output.cost_usd,
                    success: true,
                    model: output.model.clone(),
                    error: None,
                    checkpoint: checkpoint.clone(),
                    is_final_attempt: true,
                },
            )
            .await
            .map_err(|source| AttemptError::Metrics {
                agent,
                attempts: local_attempt,
                source,
            })?;

        log.log_event(
            "agent_end",
            json!({
                "success": true,
                "durationMs": output.duration_ms,
                "costUsd": output.cost_usd,
                "turns": output.turns,
                "checkpoint": checkpoint,
            }),
        )
        .await;
        self.audit
            .log_agent_end(
                agent,
                &AgentEndDetails {
                    attempt: attempt_number,
                    success: true,
                    duration_ms: output.duration_ms,
                    cost_usd: output.cost_usd,
                    error: None,
                },
            )
            .await;
        emit_agent_completed!(
            self.events,
            agent,
            attempt_number,
            output.duration_ms,
            output.cost_usd
        );
        info!(
            %agent,
            attempt = attempt_number,
            duration_ms = output.duration_ms,
            cost_usd = output.cost_usd,
            "Agent completed"
        );

        Ok(AttemptSuccess {
            agent,
            attempt_number,
            duration_ms: output.duration_ms,
            cost_usd: output.cost_usd,
            turns: output.turns,
            model: output.model,
            checkpoint,
        })
    }
}

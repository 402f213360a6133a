//! On-disk audit trail
//!
//! Layout under `<audit_root>/<session_id>/`:
//! - `agents/<unix_ms>_<agent>_attempt-<n>.log`: append-only NDJSON, one
//!   stream per attempt, every line flushed and synced
//! - `workflow.log`: human-readable timeline shared by all sub-pipelines
//!
//! [`NoopAuditSink`] stands in when no audit trail is wanted.

use agent_pipeline_sdk::PipelineStatus;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::agents::{AgentName, PhaseName};

pub const WORKFLOW_LOG_FILE: &str = "workflow.log";
pub const AGENTS_DIR: &str = "agents";

const RULE: &str =
    "================================================================================";

/// Human-readable duration (`850ms`, `12.4s`, `3m 7s`)
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        return format!("{}ms", ms);
    }
    let seconds = ms as f64 / 1000.0;
    if seconds < 60.0 {
        return format!("{:.1}s", seconds);
    }
    let minutes = ms / 60_000;
    let remaining = (ms % 60_000) / 1000;
    format!("{}m {}s", minutes, remaining)
}

fn log_time() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Start,
    Complete,
}

/// Details for an agent's end-of-attempt line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentEndDetails {
    pub attempt: u32,
    pub success: bool,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub error: Option<String>,
}

/// Per-agent line in the completion summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSummaryLine {
    pub agent: AgentName,
    pub duration_ms: u64,
    pub cost_usd: f64,
}

/// Completion block written at the end of `workflow.log`
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSummary {
    pub status: PipelineStatus,
    pub total_duration_ms: u64,
    pub total_cost_usd: f64,
    pub agents: Vec<AgentSummaryLine>,
    pub error: Option<String>,
}

// ============================================================================
// Traits
// ============================================================================

/// Event stream for one in-flight attempt
#[async_trait]
pub trait AttemptLog: Send {
    async fn log_event(&mut self, event_type: &str, data: Value);
}

/// Session-level audit destination
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn open_attempt(&self, agent: AgentName, attempt: u32) -> Box<dyn AttemptLog>;
    async fn log_phase(&self, phase: PhaseName, event: PhaseEvent);
    async fn log_agent_start(&self, agent: AgentName, attempt: u32);
    async fn log_agent_end(&self, agent: AgentName, details: &AgentEndDetails);
    async fn log_event(&self, event_type: &str, message: &str);
    async fn log_workflow_complete(&self, summary: &WorkflowSummary);
}

// ============================================================================
// File Sink
// ============================================================================

pub struct FileAttemptLog {
    path: PathBuf,
    file: Option<File>,
}

impl FileAttemptLog {
    async fn open(path: PathBuf) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        match file {
            Ok(file) => Self {
                path,
                file: Some(file),
            },
            Err(e) => {
                warn!("Failed to open attempt log {}: {}", path.display(), e);
                Self { path, file: None }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AttemptLog for FileAttemptLog {
    async fn log_event(&mut self, event_type: &str, data: Value) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let event = json!({
            "type": event_type,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });
        let line = format!("{}\n", event);

        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to write attempt log {}: {}", self.path.display(), e);
        }
    }
}

/// Audit trail written under `<audit_root>/<session_id>/`
pub struct FileAuditSink {
    session_dir: PathBuf,
    session_id: String,
    target: String,
    workflow_log: Mutex<Option<File>>,
}

impl FileAuditSink {
    pub fn new(audit_root: &Path, session_id: &str, target: &str) -> Self {
        Self {
            session_dir: audit_root.join(session_id),
            session_id: session_id.to_string(),
            target: target.to_string(),
            workflow_log: Mutex::new(None),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn workflow_log_path(&self) -> PathBuf {
        self.session_dir.join(WORKFLOW_LOG_FILE)
    }

    pub fn attempt_log_path(&self, agent: AgentName, attempt: u32) -> PathBuf {
        let unix_ms = Utc::now().timestamp_millis();
        self.session_dir
            .join(AGENTS_DIR)
            .join(format!("{}_{}_attempt-{}.log", unix_ms, agent, attempt))
    }

    /// Append text to workflow.log, opening it (and writing the header) lazily
    async fn write_workflow(&self, text: &str) {
        let mut guard = self.workflow_log.lock().await;
        if guard.is_none() {
            match self.open_workflow_log().await {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    warn!("Failed to open workflow log: {}", e);
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            let result = async {
                file.write_all(text.as_bytes()).await?;
                file.flush().await
            }
            .await;
            if let Err(e) = result {
                warn!("Failed to write workflow log: {}", e);
            }
        }
    }

    async fn open_workflow_log(&self) -> std::io::Result<File> {
        tokio::fs::create_dir_all(&self.session_dir).await?;
        let path = self.workflow_log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let empty = file.metadata().await.map(|m| m.len() == 0).unwrap_or(true);
        if empty {
            let header = format!(
                "{rule}\nAgent Pipeline - Workflow Log\n{rule}\nSession ID: {}\nTarget:     {}\nStarted:    {}\n{rule}\n",
                self.session_id,
                self.target,
                Utc::now().to_rfc3339(),
                rule = RULE
            );
            file.write_all(header.as_bytes()).await?;
        }
        Ok(file)
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn open_attempt(&self, agent: AgentName, attempt: u32) -> Box<dyn AttemptLog> {
        let agents_dir = self.session_dir.join(AGENTS_DIR);
        if let Err(e) = tokio::fs::create_dir_all(&agents_dir).await {
            warn!("Failed to create {}: {}", agents_dir.display(), e);
        }
        Box::new(FileAttemptLog::open(self.attempt_log_path(agent, attempt)).await)
    }

    async fn log_phase(&self, phase: PhaseName, event: PhaseEvent) {
        let text = match event {
            PhaseEvent::Start => format!("\n[{}] [PHASE] Start: {}\n", log_time(), phase),
            PhaseEvent::Complete => format!("[{}] [PHASE] Complete: {}\n", log_time(), phase),
        };
        self.write_workflow(&text).await;
    }

    async fn log_agent_start(&self, agent: AgentName, attempt: u32) {
        let text = format!(
            "[{}] [AGENT] {}: Start (attempt {})\n",
            log_time(),
            agent,
            attempt
        );
        self.write_workflow(&text).await;
    }

    async fn log_agent_end(&self, agent: AgentName, details: &AgentEndDetails) {
        let outcome = if details.success {
            "Complete".to_string()
        } else {
            match &details.error {
                Some(error) => format!("Failed - {}", error),
                None => "Failed".to_string(),
            }
        };
        let text = format!(
            "[{}] [AGENT] {}: {} ({} ${:.2})\n",
            log_time(),
            agent,
            outcome,
            format_duration(details.duration_ms),
            details.cost_usd
        );
        self.write_workflow(&text).await;
    }

    async fn log_event(&self, event_type: &str, message: &str) {
        let text = format!(
            "[{}] [{}] {}\n",
            log_time(),
            event_type.to_uppercase(),
            message
        );
        self.write_workflow(&text).await;
    }

    async fn log_workflow_complete(&self, summary: &WorkflowSummary) {
        let heading = match summary.status {
            PipelineStatus::Completed => "COMPLETED",
            PipelineStatus::Failed => "FAILED",
            PipelineStatus::Running => "RUNNING",
        };

        let mut text = String::new();
        text.push('\n');
        text.push_str(RULE);
        text.push('\n');
        text.push_str(&format!("Workflow {}\n", heading));
        text.push_str("----------------------------------------\n");
        text.push_str(&format!("Session ID: {}\n", self.session_id));
        text.push_str(&format!("Status:     {}\n", summary.status.as_str()));
        text.push_str(&format!(
            "Duration:   {}\n",
            format_duration(summary.total_duration_ms)
        ));
        text.push_str(&format!("Total Cost: ${:.4}\n", summary.total_cost_usd));
        text.push_str(&format!("Agents:     {} completed\n", summary.agents.len()));
        if let Some(error) = &summary.error {
            text.push_str(&format!("Error:      {}\n", error));
        }
        text.push_str("\nAgent Breakdown:\n");
        for line in &summary.agents {
            text.push_str(&format!(
                "  - {} ({}, ${:.4})\n",
                line.agent,
                format_duration(line.duration_ms),
                line.cost_usd
            ));
        }
        text.push_str(RULE);
        text.push('\n');

        self.write_workflow(&text).await;
    }
}

// ============================================================================
// Noop Sink
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAttemptLog;

#[async_trait]
impl AttemptLog for NoopAttemptLog {
    async fn log_event(&mut self, _event_type: &str, _data: Value) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn open_attempt(&self, _agent: AgentName, _attempt: u32) -> Box<dyn AttemptLog> {
        Box::new(NoopAttemptLog)
    }
    async fn log_phase(&self, _phase: PhaseName, _event: PhaseEvent) {}
    async fn log_agent_start(&self, _agent: AgentName, _attempt: u32) {}
    async fn log_agent_end(&self, _agent: AgentName, _details: &AgentEndDetails) {}
    async fn log_event(&self, _event_type: &str, _message: &str) {}
    async fn log_workflow_complete(&self, _summary: &WorkflowSummary) {}
}

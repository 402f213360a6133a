//! Session metrics store
//!
//! One JSON document per session (`<audit_root>/<session_id>/session.json`)
//! holding per-agent attempt history and derived phase aggregates.
//!
//! Every mutation runs the same cycle while holding both the in-process
//! mutex and the cross-process `session.json.lock`:
//!
//! 1. reload the latest document from disk
//! 2. apply the change
//! 3. recompute every aggregate from the successful agents
//! 4. persist atomically (temp file + rename)
//!
//! Sub-pipelines finishing attempts for different agents at the same moment
//! therefore never lose each other's writes.

use agent_pipeline_sdk::PipelineStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::agents::{AgentName, PhaseName};
use crate::classifier::truncate_message;
use crate::lock::{lock_exclusive_async, lock_path_for, LockError};

pub const SESSION_FILE: &str = "session.json";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt session document {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Out-of-order attempt for {agent}: expected {expected}, got {got}")]
    OutOfOrderAttempt { agent: String, expected: u32, got: u32 },

    #[error("Agent {agent} already succeeded")]
    DuplicateSuccess { agent: String },

    #[error("Invalid session status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

// ============================================================================
// Document
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    InProgress,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub status: AgentStatus,
    pub attempts: Vec<AttemptRecord>,
    pub final_duration_ms: u64,
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

impl AgentMetrics {
    fn new() -> Self {
        Self {
            status: AgentStatus::InProgress,
            attempts: Vec::new(),
            final_duration_ms: 0,
            total_cost_usd: 0.0,
            model: None,
            checkpoint: None,
        }
    }

    /// Number the next attempt must carry
    pub fn next_attempt_number(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMetrics {
    pub duration_ms: u64,
    pub duration_pct: f64,
    pub cost_usd: f64,
    pub agent_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub target: String,
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub total_duration_ms: u64,
    pub total_cost_usd: f64,
    pub phases: BTreeMap<String, PhaseMetrics>,
    pub agents: BTreeMap<String, AgentMetrics>,
}

/// Persisted session document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub session: SessionRecord,
    pub metrics: SessionMetrics,
}

impl SessionDocument {
    fn new(info: &SessionInfo) -> Self {
        Self {
            session: SessionRecord {
                id: info.id.clone(),
                target: info.target.clone(),
                status: PipelineStatus::Running,
                created_at: Utc::now(),
                completed_at: None,
            },
            metrics: SessionMetrics {
                total_duration_ms: 0,
                total_cost_usd: 0.0,
                phases: BTreeMap::new(),
                agents: BTreeMap::new(),
            },
        }
    }

    pub fn agent(&self, agent: AgentName) -> Option<&AgentMetrics> {
        self.metrics.agents.get(agent.as_str())
    }

    /// Successful agents in canonical order
    pub fn completed_agents(&self) -> Vec<AgentName> {
        AgentName::ALL
            .iter()
            .copied()
            .filter(|agent| {
                self.agent(*agent)
                    .map(|m| m.status == AgentStatus::Success)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Read a document from disk
    pub async fn read(path: &Path) -> Result<Self, MetricsError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| MetricsError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_str(&content).map_err(|source| MetricsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Rebuild totals and phases from the successful agents
    pub fn recompute(&mut self) {
        let successful: Vec<(AgentName, &AgentMetrics)> = self
            .metrics
            .agents
            .iter()
            .filter(|(_, m)| m.status == AgentStatus::Success)
            .filter_map(|(name, m)| name.parse::<AgentName>().ok().map(|agent| (agent, m)))
            .collect();

        let total_duration: u64 = successful.iter().map(|(_, m)| m.final_duration_ms).sum();
        let total_cost: f64 = successful.iter().map(|(_, m)| m.total_cost_usd).sum();

        let mut phases = BTreeMap::new();
        for phase in PhaseName::ALL {
            let members: Vec<&AgentMetrics> = successful
                .iter()
                .filter(|(agent, _)| agent.phase() == phase)
                .map(|(_, m)| *m)
                .collect();
            if members.is_empty() {
                continue;
            }
            let duration_ms: u64 = members.iter().map(|m| m.final_duration_ms).sum();
            phases.insert(
                phase.as_str().to_string(),
                PhaseMetrics {
                    duration_ms,
                    duration_pct: percentage(duration_ms, total_duration),
                    cost_usd: members.iter().map(|m| m.total_cost_usd).sum(),
                    agent_count: members.len(),
                },
            );
        }

        self.metrics.total_duration_ms = total_duration;
        self.metrics.total_cost_usd = total_cost;
        self.metrics.phases = phases;
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}

// ============================================================================
// Store
// ============================================================================

/// Identity of a session at creation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub target: String,
}

/// Outcome of one attempt as recorded by `end_attempt`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptResult {
    pub attempt_number: u32,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub success: bool,
    pub model: Option<String>,
    pub error: Option<String>,
    pub checkpoint: Option<String>,
    /// Marks the agent failed when this unsuccessful attempt is the last one
    pub is_final_attempt: bool,
}

pub struct SessionMetricsStore {
    path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<SessionDocument>,
}

impl SessionMetricsStore {
    /// Create the session document, or load it when it already exists
    pub async fn open(audit_root: &Path, info: SessionInfo) -> Result<Self, MetricsError> {
        let dir = audit_root.join(&info.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| MetricsError::Io {
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(SESSION_FILE);
        let lock_path = lock_path_for(&path);

        let _file_lock = lock_exclusive_async(lock_path.clone()).await?;
        let document = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(session = %info.id, "Loading existing session document");
            SessionDocument::read(&path).await?
        } else {
            let document = SessionDocument::new(&info);
            write_atomic(&path, &document).await?;
            document
        };

        Ok(Self {
            path,
            lock_path,
            state: Mutex::new(document),
        })
    }

    pub fn document_path(&self) -> &Path {
        &self.path
    }

    /// Point-in-time copy of the last loaded document
    pub async fn snapshot(&self) -> SessionDocument {
        self.state.lock().await.clone()
    }

    /// Refresh the cached document from disk
    pub async fn reload(&self) -> Result<SessionDocument, MetricsError> {
        let mut cached = self.state.lock().await;
        let _file_lock = lock_exclusive_async(self.lock_path.clone()).await?;
        let document = SessionDocument::read(&self.path).await?;
        *cached = document.clone();
        Ok(document)
    }

    /// Reserve the next contiguous attempt number for `agent`
    pub async fn start_attempt(&self, agent: AgentName) -> Result<u32, MetricsError> {
        self.mutate(|doc| {
            let metrics = doc
                .metrics
                .agents
                .entry(agent.as_str().to_string())
                .or_insert_with(AgentMetrics::new);
            if metrics.status == AgentStatus::Success {
                return Err(MetricsError::DuplicateSuccess {
                    agent: agent.to_string(),
                });
            }
            metrics.status = AgentStatus::InProgress;
            Ok(metrics.next_attempt_number())
        })
        .await
    }

    /// Record exactly one finished attempt
    pub async fn end_attempt(
        &self,
        agent: AgentName,
        result: AttemptResult,
    ) -> Result<(), MetricsError> {
        self.mutate(|doc| {
            let metrics = doc
                .metrics
                .agents
                .entry(agent.as_str().to_string())
                .or_insert_with(AgentMetrics::new);

            let expected = metrics.next_attempt_number();
            if result.attempt_number != expected {
                return Err(MetricsError::OutOfOrderAttempt {
                    agent: agent.to_string(),
                    expected,
                    got: result.attempt_number,
                });
            }
            if result.success && metrics.status == AgentStatus::Success {
                return Err(MetricsError::DuplicateSuccess {
                    agent: agent.to_string(),
                });
            }

            metrics.attempts.push(AttemptRecord {
                attempt_number: result.attempt_number,
                duration_ms: result.duration_ms,
                cost_usd: result.cost_usd,
                success: result.success,
                timestamp: Utc::now(),
                model: result.model.clone(),
                error: result.error.as_deref().map(truncate_message),
            });
            metrics.total_cost_usd = metrics.attempts.iter().map(|a| a.cost_usd).sum();

            if result.success {
                metrics.status = AgentStatus::Success;
                metrics.final_duration_ms = result.duration_ms;
                if result.model.is_some() {
                    metrics.model = result.model;
                }
                if result.checkpoint.is_some() {
                    metrics.checkpoint = result.checkpoint;
                }
            } else if result.is_final_attempt {
                metrics.status = AgentStatus::Failed;
            }
            Ok(())
        })
        .await
    }

    /// Move the session from running to a terminal status
    pub async fn update_session_status(&self, status: PipelineStatus) -> Result<(), MetricsError> {
        self.mutate(|doc| {
            let from = doc.session.status;
            if from != PipelineStatus::Running || status == PipelineStatus::Running {
                return Err(MetricsError::InvalidTransition {
                    from: from.as_str().to_string(),
                    to: status.as_str().to_string(),
                });
            }
            doc.session.status = status;
            doc.session.completed_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    /// Put a finished session back into running for a resumed run
    pub async fn reopen(&self) -> Result<(), MetricsError> {
        self.mutate(|doc| {
            doc.session.status = PipelineStatus::Running;
            doc.session.completed_at = None;
            Ok(())
        })
        .await
    }

    /// reload → apply → recompute → persist, under both locks
    async fn mutate<T, F>(&self, apply: F) -> Result<T, MetricsError>
    where
        F: FnOnce(&mut SessionDocument) -> Result<T, MetricsError>,
    {
        let mut cached = self.state.lock().await;
        let _file_lock = lock_exclusive_async(self.lock_path.clone()).await?;

        let mut document = SessionDocument::read(&self.path).await?;
        let result = apply(&mut document);
        if result.is_ok() {
            document.recompute();
            write_atomic(&self.path, &document).await?;
        }
        *cached = document;
        result
    }
}

/// Write to a unique temp file, fsync, then rename over `path`
async fn write_atomic(path: &Path, document: &SessionDocument) -> Result<(), MetricsError> {
    let content = serde_json::to_vec_pretty(document).map_err(|source| MetricsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| SESSION_FILE.to_string());
    let tmp_path = path.with_file_name(format!("{}.{}.tmp", file_name, Uuid::new_v4()));

    let io_err = |source: std::io::Error| MetricsError::Io {
        path: tmp_path.clone(),
        source,
    };

    let write = async {
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
        file.write_all(&content).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await.map_err(io_err)
    };

    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

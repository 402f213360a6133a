//! Queue validation gate
//!
//! A vulnerability-analysis agent must leave two artifacts behind: a
//! markdown deliverable and a JSON exploitation queue. The gate checks the
//! pair and decides whether the matching exploit agent should run.
//!
//! The check is an explicit sequence of steps, each returning
//! `Result<_, GateError>` and short-circuiting on the first error:
//!
//! `resolve_paths → check_existence → enforce_symmetry → read_queue/parse_queue → decide`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::agents::VulnType;
use crate::classifier::{ClassifiedError, ErrorKind};

#[derive(Debug, Error)]
pub enum GateError {
    /// Exactly one, or neither, of the artifact pair exists
    #[error("{} ({work_type})", asymmetry_message(.deliverable_exists, .queue_exists))]
    AsymmetricArtifacts {
        work_type: VulnType,
        deliverable_exists: bool,
        queue_exists: bool,
    },

    /// Queue is not JSON, or lacks an `items` array
    #[error("Queue validation failed for {work_type}: {reason}")]
    MalformedQueue { work_type: VulnType, reason: String },

    /// Queue exists but could not be read
    #[error("Failed to read queue file {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GateError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GateError::AsymmetricArtifacts { .. } | GateError::MalformedQueue { .. } => true,
            GateError::Unreadable { .. } => false,
        }
    }

    /// Same failure in the engine-wide taxonomy
    pub fn to_classified(&self) -> ClassifiedError {
        let kind = if self.is_retryable() {
            ErrorKind::OutputValidationFailure
        } else {
            ErrorKind::Configuration
        };
        ClassifiedError::of_kind(kind, self.to_string())
    }
}

fn asymmetry_message(deliverable_exists: &bool, queue_exists: &bool) -> &'static str {
    match (*deliverable_exists, *queue_exists) {
        (false, false) => {
            "Analysis failed: Neither deliverable nor queue file exists. Analysis agent must create both files."
        }
        (true, false) => {
            "Analysis incomplete: Deliverable exists but queue file missing. Analysis agent must create both files."
        }
        _ => {
            "Analysis incomplete: Queue exists but deliverable file missing. Analysis agent must create both files."
        }
    }
}

/// Whether the exploit agent should run, derived and never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExploitationDecision {
    pub should_exploit: bool,
    pub vulnerability_count: usize,
    pub work_type: VulnType,
}

/// Queue document written by an analysis agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploitationQueue {
    #[serde(alias = "vulnerabilities")]
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub work_type: VulnType,
    pub deliverable: PathBuf,
    pub queue: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactExistence {
    pub paths: ArtifactPaths,
    pub deliverable_exists: bool,
    pub queue_exists: bool,
}

// ============================================================================
// Steps
// ============================================================================

pub fn resolve_paths(work_type: VulnType, workspace: &Path) -> ArtifactPaths {
    ArtifactPaths {
        work_type,
        deliverable: work_type.deliverable_path(workspace),
        queue: work_type.queue_path(workspace),
    }
}

pub async fn check_existence(paths: ArtifactPaths) -> ArtifactExistence {
    let (deliverable_exists, queue_exists) = tokio::join!(
        tokio::fs::try_exists(&paths.deliverable),
        tokio::fs::try_exists(&paths.queue)
    );
    ArtifactExistence {
        paths,
        deliverable_exists: deliverable_exists.unwrap_or(false),
        queue_exists: queue_exists.unwrap_or(false),
    }
}

/// Both artifacts or an error
pub fn enforce_symmetry(existence: ArtifactExistence) -> Result<ArtifactPaths, GateError> {
    if existence.deliverable_exists && existence.queue_exists {
        return Ok(existence.paths);
    }
    Err(GateError::AsymmetricArtifacts {
        work_type: existence.paths.work_type,
        deliverable_exists: existence.deliverable_exists,
        queue_exists: existence.queue_exists,
    })
}

pub async fn read_queue(paths: &ArtifactPaths) -> Result<ExploitationQueue, GateError> {
    let content = tokio::fs::read_to_string(&paths.queue)
        .await
        .map_err(|source| GateError::Unreadable {
            path: paths.queue.clone(),
            source,
        })?;
    parse_queue(paths.work_type, &content)
}

/// Parse queue JSON, telling syntax errors apart from shape errors
pub fn parse_queue(work_type: VulnType, content: &str) -> Result<ExploitationQueue, GateError> {
    let value: Value = serde_json::from_str(content).map_err(|e| GateError::MalformedQueue {
        work_type,
        reason: format!(
            "Invalid JSON structure ({}). Analysis agent must fix queue format.",
            e
        ),
    })?;

    serde_json::from_value(value).map_err(|e| GateError::MalformedQueue {
        work_type,
        reason: format!(
            "Missing or invalid 'items' array ({}). Analysis agent must fix queue structure.",
            e
        ),
    })
}

pub fn decide(work_type: VulnType, queue: &ExploitationQueue) -> ExploitationDecision {
    ExploitationDecision {
        should_exploit: !queue.items.is_empty(),
        vulnerability_count: queue.items.len(),
        work_type,
    }
}

/// Runs the full step sequence for one sub-pipeline
pub struct QueueValidationGate;

impl QueueValidationGate {
    pub async fn decide(
        work_type: VulnType,
        workspace: &Path,
    ) -> Result<ExploitationDecision, GateError> {
        let existence = check_existence(resolve_paths(work_type, workspace)).await;
        let paths = enforce_symmetry(existence)?;
        let queue = read_queue(&paths).await?;
        Ok(decide(work_type, &queue))
    }
}

//! Workspace checkpoint, rollback and commit
//!
//! All agents share one mutable workspace. Every mutation of its version
//! control state goes through a single FIFO semaphore (in-process) and an
//! advisory file lock inside the git directory (cross-process), held for the
//! whole operation so no two sub-pipelines ever interleave git commands.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::CommitIdentity;
use crate::lock::{lock_exclusive_async, LockError};

/// Lock file created inside the git directory
const GIT_LOCK_FILE: &str = "agent-pipeline.lock";

/// Stderr fragments of git failures caused by a competing git process
const GIT_LOCK_ERROR_PATTERNS: &[&str] = &[
    "index.lock",
    "unable to lock",
    "Another git process",
    "fatal: Unable to create",
    "fatal: index file",
];

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("git {command} still locked after {attempts} attempts: {stderr}")]
    LockRetriesExhausted {
        command: String,
        attempts: u32,
        stderr: String,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Checkpoint semaphore closed")]
    SemaphoreClosed,
}

/// Identifies the attempt a checkpoint or commit belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointTag {
    pub agent: String,
    pub attempt: u32,
}

impl CheckpointTag {
    pub fn new(agent: impl Into<String>, attempt: u32) -> Self {
        Self {
            agent: agent.into(),
            attempt,
        }
    }
}

/// What a checkpoint operation did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointOutcome {
    /// Files the operation staged or discarded
    pub files_changed: usize,
    /// True when the workspace is not under version control
    pub skipped: bool,
}

impl CheckpointOutcome {
    fn skipped() -> Self {
        Self {
            files_changed: 0,
            skipped: true,
        }
    }
}

/// Snapshot/rollback/commit on the shared workspace
#[async_trait]
pub trait WorkspaceCheckpointer: Send + Sync {
    /// Snapshot before an attempt; attempts after the first roll back first
    async fn checkpoint(&self, tag: &CheckpointTag) -> Result<CheckpointOutcome, CheckpointError>;

    /// Return to the last committed state, tracked and untracked
    async fn rollback(&self, reason: &str) -> Result<CheckpointOutcome, CheckpointError>;

    /// Record a successful attempt's changes
    async fn commit(&self, tag: &CheckpointTag) -> Result<CheckpointOutcome, CheckpointError>;

    /// Current commit hash, `None` outside a repository
    async fn head(&self) -> Option<String>;
}

// ============================================================================
// Git
// ============================================================================

/// Git-backed checkpointer
pub struct GitCheckpointer {
    workspace: PathBuf,
    semaphore: Arc<Semaphore>,
    lock_retries: u32,
    base_delay: Duration,
    identity: Option<CommitIdentity>,
}

impl GitCheckpointer {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            semaphore: Arc::new(Semaphore::new(1)),
            lock_retries: 5,
            base_delay: Duration::from_secs(1),
            identity: None,
        }
    }

    pub fn with_lock_retries(mut self, retries: u32, base_delay: Duration) -> Self {
        self.lock_retries = retries.max(1);
        self.base_delay = base_delay;
        self
    }

    pub fn with_identity(mut self, identity: Option<CommitIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Absolute git directory, `None` when the workspace is not a repository
    async fn git_dir(&self) -> Option<PathBuf> {
        let output = Command::new("git")
            .args(["rev-parse", "--absolute-git-dir"])
            .current_dir(&self.workspace)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }

    /// Run one git command, retrying lock conflicts with exponential backoff
    async fn git(&self, args: &[&str]) -> Result<Output, CheckpointError> {
        let command = args.join(" ");
        let mut full_args: Vec<String> = Vec::new();
        if let Some(identity) = &self.identity {
            full_args.push("-c".to_string());
            full_args.push(format!("user.name={}", identity.name));
            full_args.push("-c".to_string());
            full_args.push(format!("user.email={}", identity.email));
        }
        full_args.extend(args.iter().map(|a| a.to_string()));

        for attempt in 1..=self.lock_retries {
            let output = Command::new("git")
                .args(&full_args)
                .current_dir(&self.workspace)
                .output()
                .await
                .map_err(|source| CheckpointError::Spawn {
                    command: command.clone(),
                    source,
                })?;

            if output.status.success() {
                return Ok(output);
            }

            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if !is_lock_conflict(&stderr) {
                return Err(CheckpointError::Git { command, stderr });
            }
            if attempt == self.lock_retries {
                return Err(CheckpointError::LockRetriesExhausted {
                    command,
                    attempts: attempt,
                    stderr,
                });
            }

            let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
            warn!(
                attempt,
                max_retries = self.lock_retries,
                delay_ms = delay.as_millis() as u64,
                "Git lock conflict during {}, retrying",
                command
            );
            tokio::time::sleep(delay).await;
        }

        Err(CheckpointError::LockRetriesExhausted {
            command,
            attempts: self.lock_retries,
            stderr: String::new(),
        })
    }

    async fn changed_files(&self) -> Result<Vec<String>, CheckpointError> {
        let output = self.git(&["status", "--porcelain"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect())
    }

    /// Rollback body; caller holds the semaphore and file lock
    async fn rollback_locked(&self, reason: &str) -> Result<CheckpointOutcome, CheckpointError> {
        let changes = self.changed_files().await?;
        self.git(&["reset", "--hard", "HEAD"]).await?;
        self.git(&["clean", "-fd"]).await?;
        info!(
            reason,
            files_removed = changes.len(),
            "Rolled back workspace to last commit"
        );
        Ok(CheckpointOutcome {
            files_changed: changes.len(),
            skipped: false,
        })
    }

    /// Stage everything and commit, even with no changes
    async fn commit_all_locked(&self, message: &str) -> Result<CheckpointOutcome, CheckpointError> {
        let changes = self.changed_files().await?;
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "-m", message, "--allow-empty"]).await?;
        Ok(CheckpointOutcome {
            files_changed: changes.len(),
            skipped: false,
        })
    }
}

#[async_trait]
impl WorkspaceCheckpointer for GitCheckpointer {
    async fn checkpoint(&self, tag: &CheckpointTag) -> Result<CheckpointOutcome, CheckpointError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CheckpointError::SemaphoreClosed)?;
        let Some(git_dir) = self.git_dir().await else {
            debug!(agent = %tag.agent, "Skipping checkpoint (not a git repository)");
            return Ok(CheckpointOutcome::skipped());
        };
        let _lock = lock_exclusive_async(git_dir.join(GIT_LOCK_FILE)).await?;

        if tag.attempt > 1 {
            let reason = format!("{} (retry cleanup)", tag.agent);
            if let Err(e) = self.rollback_locked(&reason).await {
                warn!(agent = %tag.agent, "Workspace cleanup failed, continuing: {}", e);
            }
        }

        let message = format!("checkpoint: {} (attempt {})", tag.agent, tag.attempt);
        let outcome = self.commit_all_locked(&message).await?;
        info!(
            agent = %tag.agent,
            attempt = tag.attempt,
            files = outcome.files_changed,
            "Checkpoint created"
        );
        Ok(outcome)
    }

    async fn rollback(&self, reason: &str) -> Result<CheckpointOutcome, CheckpointError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CheckpointError::SemaphoreClosed)?;
        let Some(git_dir) = self.git_dir().await else {
            debug!("Skipping rollback (not a git repository)");
            return Ok(CheckpointOutcome::skipped());
        };
        let _lock = lock_exclusive_async(git_dir.join(GIT_LOCK_FILE)).await?;
        self.rollback_locked(reason).await
    }

    async fn commit(&self, tag: &CheckpointTag) -> Result<CheckpointOutcome, CheckpointError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CheckpointError::SemaphoreClosed)?;
        let Some(git_dir) = self.git_dir().await else {
            debug!(agent = %tag.agent, "Skipping commit (not a git repository)");
            return Ok(CheckpointOutcome::skipped());
        };
        let _lock = lock_exclusive_async(git_dir.join(GIT_LOCK_FILE)).await?;

        let message = format!("{}: completed successfully", tag.agent);
        let outcome = self.commit_all_locked(&message).await?;
        info!(
            agent = %tag.agent,
            files = outcome.files_changed,
            "Committed successful attempt"
        );
        Ok(outcome)
    }

    async fn head(&self) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.workspace)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!hash.is_empty()).then_some(hash)
    }
}

pub fn is_lock_conflict(stderr: &str) -> bool {
    GIT_LOCK_ERROR_PATTERNS
        .iter()
        .any(|pattern| stderr.contains(pattern))
}

// ============================================================================
// Noop
// ============================================================================

/// Checkpointer for workspaces without version control
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpointer;

#[async_trait]
impl WorkspaceCheckpointer for NoopCheckpointer {
    async fn checkpoint(&self, _tag: &CheckpointTag) -> Result<CheckpointOutcome, CheckpointError> {
        Ok(CheckpointOutcome::skipped())
    }

    async fn rollback(&self, _reason: &str) -> Result<CheckpointOutcome, CheckpointError> {
        Ok(CheckpointOutcome::skipped())
    }

    async fn commit(&self, _tag: &CheckpointTag) -> Result<CheckpointOutcome, CheckpointError> {
        Ok(CheckpointOutcome::skipped())
    }

    async fn head(&self) -> Option<String> {
        None
    }
}

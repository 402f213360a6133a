//! Pipeline configuration
//!
//! Loaded from YAML; every field has a default so an empty file (or no file)
//! is a valid production configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::ClassifierPolicy;

/// Retry timing for one agent, mirroring the outer supervisor's activity policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryProfile {
    /// First billing/quota backoff interval
    pub initial_interval_secs: u64,
    /// Ceiling for billing/quota backoff
    pub max_interval_secs: u64,
    pub backoff_coefficient: f64,
    pub max_attempts: u32,
    /// Hard wall-clock ceiling for one attempt
    pub attempt_timeout_secs: u64,
    /// Liveness window the supervisor allows between heartbeats
    pub heartbeat_timeout_secs: u64,
}

impl RetryProfile {
    pub fn production() -> Self {
        Self {
            initial_interval_secs: 5 * 60,
            max_interval_secs: 30 * 60,
            backoff_coefficient: 2.0,
            max_attempts: 50,
            attempt_timeout_secs: 2 * 60 * 60,
            heartbeat_timeout_secs: 60 * 60,
        }
    }

    pub fn testing() -> Self {
        Self {
            initial_interval_secs: 10,
            max_interval_secs: 30,
            backoff_coefficient: 2.0,
            max_attempts: 5,
            attempt_timeout_secs: 30 * 60,
            heartbeat_timeout_secs: 30 * 60,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs(self.initial_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }
}

/// Named retry presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPreset {
    Production,
    Testing,
}

/// `retry:` accepts either a preset name or a full profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetrySetting {
    Preset(RetryPreset),
    Custom(RetryProfile),
}

impl Default for RetrySetting {
    fn default() -> Self {
        RetrySetting::Preset(RetryPreset::Production)
    }
}

impl RetrySetting {
    pub fn profile(&self) -> RetryProfile {
        match self {
            RetrySetting::Preset(RetryPreset::Production) => RetryProfile::production(),
            RetrySetting::Preset(RetryPreset::Testing) => RetryProfile::testing(),
            RetrySetting::Custom(profile) => profile.clone(),
        }
    }
}

/// Author used for checkpoint commits when the workspace has none configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

fn default_heartbeat_interval_secs() -> u64 {
    2
}

fn default_max_output_validation_attempts() -> u32 {
    3
}

fn default_unclassified_retryable() -> bool {
    true
}

fn default_max_parallel_pipelines() -> usize {
    5
}

fn default_gate_attempts() -> u32 {
    3
}

fn default_git_lock_retries() -> u32 {
    5
}

fn default_git_lock_base_delay_ms() -> u64 {
    1000
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root for per-session audit directories (platform data dir when unset)
    #[serde(default)]
    pub audit_root: Option<PathBuf>,

    #[serde(default)]
    pub retry: RetrySetting,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Separate budget for attempts whose artifacts fail validation
    #[serde(default = "default_max_output_validation_attempts")]
    pub max_output_validation_attempts: u32,

    /// Whether failures matching no known pattern are retried
    #[serde(default = "default_unclassified_retryable")]
    pub unclassified_retryable: bool,

    #[serde(default = "default_max_parallel_pipelines")]
    pub max_parallel_pipelines: usize,

    /// How often a retryable gate error is re-checked before giving up
    #[serde(default = "default_gate_attempts")]
    pub gate_attempts: u32,

    #[serde(default = "default_git_lock_retries")]
    pub git_lock_retries: u32,

    #[serde(default = "default_git_lock_base_delay_ms")]
    pub git_lock_base_delay_ms: u64,

    #[serde(default)]
    pub commit_identity: Option<CommitIdentity>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            audit_root: None,
            retry: RetrySetting::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_output_validation_attempts: default_max_output_validation_attempts(),
            unclassified_retryable: default_unclassified_retryable(),
            max_parallel_pipelines: default_max_parallel_pipelines(),
            gate_attempts: default_gate_attempts(),
            git_lock_retries: default_git_lock_retries(),
            git_lock_base_delay_ms: default_git_lock_base_delay_ms(),
            commit_identity: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("Failed to parse YAML")
    }

    /// Switch to the short testing retry preset
    pub fn testing(mut self) -> Self {
        self.retry = RetrySetting::Preset(RetryPreset::Testing);
        self
    }

    pub fn retry_profile(&self) -> RetryProfile {
        self.retry.profile()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn git_lock_base_delay(&self) -> Duration {
        Duration::from_millis(self.git_lock_base_delay_ms)
    }

    pub fn classifier_policy(&self) -> ClassifierPolicy {
        ClassifierPolicy {
            unclassified_retryable: self.unclassified_retryable,
        }
    }

    /// Configured audit root, else the platform data directory
    pub fn resolved_audit_root(&self) -> PathBuf {
        self.audit_root.clone().unwrap_or_else(default_audit_root)
    }
}

/// `<data dir>/agent-pipeline/audit-logs`, falling back to `./audit-logs`
pub fn default_audit_root() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "agent-pipeline") {
        proj_dirs.data_dir().join("audit-logs")
    } else {
        PathBuf::from("audit-logs")
    }
}

//! Failure classification and retry backoff
//!
//! `classify` maps any failure message to an [`ErrorKind`] plus a retry
//! decision. It is pure and total: every input yields a classification.
//! Rules are case-insensitive substring matches checked in precedence order,
//! first match wins.

use agent_pipeline_sdk::AgentOutput;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::RetryProfile;

/// Longest error message carried into persisted records
pub const MAX_ERROR_LENGTH: usize = 2000;

/// Cap for short exponential backoff
const TRANSIENT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Cap for rate-limit backoff
const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(120);

// ============================================================================
// Error Taxonomy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BillingOrQuota,
    TransientInfra,
    OutputValidationFailure,
    Authentication,
    Permission,
    InvalidRequest,
    RequestTooLarge,
    Configuration,
    InvalidTarget,
    ExecutionLimit,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::BillingOrQuota,
        ErrorKind::TransientInfra,
        ErrorKind::OutputValidationFailure,
        ErrorKind::Authentication,
        ErrorKind::Permission,
        ErrorKind::InvalidRequest,
        ErrorKind::RequestTooLarge,
        ErrorKind::Configuration,
        ErrorKind::InvalidTarget,
        ErrorKind::ExecutionLimit,
    ];

    /// Default disposition for this kind
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::BillingOrQuota | ErrorKind::TransientInfra | ErrorKind::OutputValidationFailure
        )
    }

    /// Type name shared with the outer supervisor's non-retryable list
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BillingOrQuota => "BillingError",
            ErrorKind::TransientInfra => "TransientError",
            ErrorKind::OutputValidationFailure => "OutputValidationError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Permission => "PermissionError",
            ErrorKind::InvalidRequest => "InvalidRequestError",
            ErrorKind::RequestTooLarge => "RequestTooLargeError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::InvalidTarget => "InvalidTargetError",
            ErrorKind::ExecutionLimit => "ExecutionLimitError",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        ErrorKind::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

/// A failure together with its classification
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(classification: Classification, message: impl Into<String>) -> Self {
        Self {
            kind: classification.kind,
            retryable: classification.retryable,
            message: truncate_message(&message.into()),
        }
    }

    /// Classify a raw message
    pub fn from_message(message: impl Into<String>, policy: &ClassifierPolicy) -> Self {
        let message = message.into();
        Self::new(classify(&message, policy), message)
    }

    /// Build with the kind's default disposition
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(
            Classification {
                kind,
                retryable: kind.is_retryable(),
            },
            message,
        )
    }
}

/// Tunables for the fallback branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierPolicy {
    /// Retry failures that match no rule
    pub unclassified_retryable: bool,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            unclassified_retryable: true,
        }
    }
}

// ============================================================================
// Classification Rules
// ============================================================================

const BILLING_PATTERNS: &[&str] = &[
    "billing_error",
    "credit balance is too low",
    "insufficient credits",
    "usage is blocked due to insufficient credits",
    "please visit plans & billing",
    "please visit plans and billing",
    "usage limit reached",
    "quota exceeded",
    "daily rate limit",
    "limit will reset",
    "spending cap",
    "spending limit",
    "cap reached",
    "budget exceeded",
    "billing limit reached",
];

const AUTHENTICATION_PATTERNS: &[&str] = &["authentication", "api key", "401"];

const PERMISSION_PATTERNS: &[&str] = &["permission", "forbidden", "403"];

const OUTPUT_VALIDATION_PATTERNS: &[&str] =
    &["failed output validation", "output validation failed"];

// Checked before the generic "malformed" request rule, which would shadow it
const INVALID_TARGET_PATTERNS: &[&str] =
    &["invalid url", "invalid target", "malformed url", "invalid uri"];

const INVALID_REQUEST_PATTERNS: &[&str] = &["invalid_request_error", "malformed", "validation"];

const TOO_LARGE_PATTERNS: &[&str] = &["request_too_large", "too large", "413"];

const CONFIGURATION_PATTERNS: &[&str] = &["enoent", "no such file", "cli not installed"];

const EXECUTION_LIMIT_PATTERNS: &[&str] = &[
    "max turns",
    "budget",
    "execution limit",
    "error_max_turns",
    "error_max_budget",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "network",
    "connection",
    "timeout",
    "timed out",
    "econnreset",
    "enotfound",
    "econnrefused",
    "rate limit",
    "429",
    "too many requests",
    "server error",
    "5xx",
    "502",
    "503",
    "bad gateway",
    "service unavailable",
    "overloaded",
    "model unavailable",
    "terminated",
];

const RULES: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::BillingOrQuota, BILLING_PATTERNS),
    (ErrorKind::Authentication, AUTHENTICATION_PATTERNS),
    (ErrorKind::Permission, PERMISSION_PATTERNS),
    (ErrorKind::OutputValidationFailure, OUTPUT_VALIDATION_PATTERNS),
    (ErrorKind::InvalidTarget, INVALID_TARGET_PATTERNS),
    (ErrorKind::InvalidRequest, INVALID_REQUEST_PATTERNS),
    (ErrorKind::RequestTooLarge, TOO_LARGE_PATTERNS),
    (ErrorKind::Configuration, CONFIGURATION_PATTERNS),
    (ErrorKind::ExecutionLimit, EXECUTION_LIMIT_PATTERNS),
    (ErrorKind::TransientInfra, TRANSIENT_PATTERNS),
];

/// Classify a failure message
///
/// # Example
/// ```
/// use agent_pipeline::classifier::{classify, ClassifierPolicy, ErrorKind};
///
/// let c = classify("Spending cap reached", &ClassifierPolicy::default());
/// assert_eq!(c.kind, ErrorKind::BillingOrQuota);
/// assert!(c.retryable);
/// ```
pub fn classify(message: &str, policy: &ClassifierPolicy) -> Classification {
    let lowered = message.to_lowercase();

    for (kind, patterns) in RULES {
        if patterns.iter().any(|pattern| lowered.contains(pattern)) {
            return Classification {
                kind: *kind,
                retryable: kind.is_retryable(),
            };
        }
    }

    Classification {
        kind: ErrorKind::TransientInfra,
        retryable: policy.unclassified_retryable,
    }
}

/// Classify a failed runner output, preferring a runner-supplied error kind
pub fn classify_output(output: &AgentOutput, policy: &ClassifierPolicy) -> ClassifiedError {
    let message = output
        .error
        .clone()
        .unwrap_or_else(|| "Agent execution failed".to_string());

    match output.error_kind.as_deref().and_then(ErrorKind::from_type_name) {
        Some(kind) => ClassifiedError::of_kind(kind, message),
        None => ClassifiedError::from_message(message, policy),
    }
}

/// Words in a nominally successful result that indicate a billing notice
const SPENDING_CAP_HINTS: &[&str] = &["spending", "cap", "limit", "budget", "resets"];

/// Detect a "successful" result that is really a spending-cap notice
///
/// Such results finish in at most two turns, cost nothing and talk about
/// limits.
pub fn looks_like_spending_cap(output: &AgentOutput) -> bool {
    if !output.success {
        return false;
    }
    let turns = output.turns.unwrap_or(0);
    if turns > 2 || output.cost_usd != 0.0 {
        return false;
    }
    let text = output.result_text.as_deref().unwrap_or("").to_lowercase();
    SPENDING_CAP_HINTS.iter().any(|hint| text.contains(hint))
}

/// Truncate to [`MAX_ERROR_LENGTH`] bytes on a char boundary
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_ERROR_LENGTH {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LENGTH;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

// ============================================================================
// Backoff
// ============================================================================

/// Delay before retrying after `error` on attempt `attempt` (1-based)
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, error: &ClassifiedError, attempt: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(&ClassifiedError, u32) -> Duration + Send + Sync,
{
    fn delay(&self, error: &ClassifiedError, attempt: u32) -> Duration {
        self(error, attempt)
    }
}

/// Long profile-driven backoff for billing, short jittered backoff otherwise
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub billing_initial: Duration,
    pub billing_max: Duration,
    pub coefficient: f64,
}

impl ExponentialBackoff {
    pub fn from_profile(profile: &RetryProfile) -> Self {
        Self {
            billing_initial: profile.initial_interval(),
            billing_max: profile.max_interval(),
            coefficient: profile.backoff_coefficient,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, error: &ClassifiedError, attempt: u32) -> Duration {
        let attempt = attempt.max(1);

        if error.kind == ErrorKind::BillingOrQuota {
            let max = self.billing_max.as_secs_f64();
            // f64::max discards NaN, so the interval never shrinks below the initial one
            let factor = self.coefficient.max(1.0).powi(attempt as i32 - 1);
            let secs = self.billing_initial.as_secs_f64() * factor;
            if !secs.is_finite() {
                return self.billing_max;
            }
            return Duration::from_secs_f64(secs.clamp(0.0, max));
        }

        let lowered = error.message.to_lowercase();
        if lowered.contains("rate limit") || lowered.contains("429") {
            let delay = Duration::from_secs(30 + u64::from(attempt) * 10);
            return delay.min(RATE_LIMIT_MAX_DELAY);
        }

        let base = Duration::from_secs(2u64.saturating_pow(attempt.min(16)));
        (base + jitter()).min(TRANSIENT_MAX_DELAY)
    }
}

/// 0-1 s of jitter from the clock's sub-second nanos
fn jitter() -> Duration {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % 1000)
        .unwrap_or(0);
    Duration::from_millis(millis)
}

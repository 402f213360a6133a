//! Attempt controller: retry loop, validation budget, accounting

use super::common::*;
use agent_pipeline::agents::AgentName;
use agent_pipeline::attempt::AttemptError;
use agent_pipeline::audit::{AuditSink, FileAuditSink};
use agent_pipeline::classifier::ErrorKind;
use agent_pipeline::metrics::AgentStatus;
use agent_pipeline_sdk::{AgentOutput, PipelineEvent};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Retry Loop
// ============================================================================

#[tokio::test]
async fn test_transient_failure_then_success() {
    let runner = FakeRunner::new(|_, call, _| {
        if call == 1 {
            transient_failure()
        } else {
            ok_output()
        }
    });
    let h = Harness::new(runner, PredicateValidator::accept_all(), settings(5)).await;

    let success = h
        .controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap();
    assert_eq!(success.attempt_number, 2);
    assert_eq!(success.checkpoint.as_deref(), Some("head-1"));

    let doc = h.metrics.snapshot().await;
    let recon = doc.agent(AgentName::Recon).unwrap();
    assert_eq!(recon.status, AgentStatus::Success);
    assert_eq!(recon.attempts.len(), 2);
    assert!(!recon.attempts[0].success);
    assert!(recon.attempts[1].success);
    assert_eq!(recon.attempts[0].attempt_number, 1);
    assert_eq!(recon.attempts[1].attempt_number, 2);
    assert_eq!(recon.final_duration_ms, 100);
    assert_eq!(recon.total_cost_usd, 0.75);
    assert_eq!(recon.checkpoint.as_deref(), Some("head-1"));

    // Single final committed checkpoint
    assert_eq!(h.checkpointer.count("commit:"), 1);
    assert_eq!(
        h.checkpointer.ops(),
        vec![
            "checkpoint:recon:1".to_string(),
            "rollback:TransientError".to_string(),
            "checkpoint:recon:2".to_string(),
            "commit:recon:2".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_non_retryable_failure_stops_immediately() {
    let h = Harness::new(
        FakeRunner::new(|_, _, _| auth_failure()),
        PredicateValidator::accept_all(),
        settings(5),
    )
    .await;

    let err = h
        .controller
        .run_with_retry(AgentName::PreRecon, h.input(AgentName::PreRecon), no_backoff().as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, AttemptError::NonRetryable { attempts: 1, .. }));
    assert_eq!(err.classified().kind, ErrorKind::Authentication);
    assert_eq!(h.runner.call_count("pre-recon"), 1);

    let doc = h.metrics.snapshot().await;
    let agent = doc.agent(AgentName::PreRecon).unwrap();
    assert_eq!(agent.status, AgentStatus::Failed);
    assert_eq!(agent.attempts.len(), 1);
    assert!(agent.attempts[0].error.as_deref().unwrap().contains("401"));
    assert_eq!(h.checkpointer.count("rollback:"), 1);
    assert_eq!(h.checkpointer.count("commit:"), 0);
}

#[tokio::test]
async fn test_retries_exhausted_accounts_every_attempt() {
    let h = Harness::new(
        FakeRunner::new(|_, _, _| transient_failure()),
        PredicateValidator::accept_all(),
        settings(3),
    )
    .await;

    let err = h
        .controller
        .run_with_retry(AgentName::XssVuln, h.input(AgentName::XssVuln), no_backoff().as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, AttemptError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(err.classified().kind, ErrorKind::TransientInfra);

    let doc = h.metrics.snapshot().await;
    let agent = doc.agent(AgentName::XssVuln).unwrap();
    let numbers: Vec<u32> = agent.attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(agent.total_cost_usd, 1.5);
    assert_eq!(agent.status, AgentStatus::Failed);
    // Failed agents contribute nothing to the aggregates
    assert_eq!(doc.metrics.total_cost_usd, 0.0);
}

#[tokio::test]
async fn test_runner_error_kind_is_honoured() {
    let h = Harness::new(
        FakeRunner::new(|_, _, _| {
            AgentOutput::failed("tool call rejected").with_error_kind("PermissionError")
        }),
        PredicateValidator::accept_all(),
        settings(5),
    )
    .await;

    let err = h
        .controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap_err();
    assert_eq!(err.classified().kind, ErrorKind::Permission);
    assert_eq!(err.attempts(), 1);
}

#[tokio::test]
async fn test_backoff_receives_error_and_attempt() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_by_policy = seen.clone();
    let backoff = move |error: &agent_pipeline::classifier::ClassifiedError, attempt: u32| {
        seen_by_policy.lock().unwrap().push((error.kind, attempt));
        Duration::ZERO
    };

    let h = Harness::new(
        FakeRunner::new(|_, call, _| if call < 3 { transient_failure() } else { ok_output() }),
        PredicateValidator::accept_all(),
        settings(5),
    )
    .await;
    h.controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), &backoff)
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(ErrorKind::TransientInfra, 1), (ErrorKind::TransientInfra, 2)]
    );
}

// ============================================================================
// Output Validation
// ============================================================================

#[tokio::test]
async fn test_validation_failure_is_retried() {
    let h = Harness::new(
        FakeRunner::new(|_, call, _| {
            if call == 1 {
                AgentOutput::succeeded("incomplete", 10, 0.1)
            } else {
                ok_output()
            }
        }),
        PredicateValidator::new(|_, output| output.result_text.as_deref() == Some("done")),
        settings(5),
    )
    .await;

    let success = h
        .controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap();
    assert_eq!(success.attempt_number, 2);
    assert_eq!(h.checkpointer.count("rollback:OutputValidationError"), 1);
}

#[tokio::test]
async fn test_validation_budget_is_separate_from_max_attempts() {
    let h = Harness::new(
        FakeRunner::always_ok(),
        PredicateValidator::new(|_, _| false),
        settings(10),
    )
    .await;

    let err = h
        .controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, AttemptError::ValidationExhausted { attempts: 3, .. }));
    assert_eq!(err.classified().kind, ErrorKind::OutputValidationFailure);
    assert_eq!(h.runner.call_count("recon"), 3);

    let doc = h.metrics.snapshot().await;
    assert_eq!(doc.agent(AgentName::Recon).unwrap().status, AgentStatus::Failed);
}

#[tokio::test]
async fn test_validation_failure_on_final_attempt_is_exhausted() {
    let h = Harness::new(
        FakeRunner::new(|_, call, _| if call == 1 { transient_failure() } else { ok_output() }),
        PredicateValidator::new(|_, _| false),
        settings(2),
    )
    .await;

    let err = h
        .controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, AttemptError::ValidationExhausted { attempts: 2, .. }));
}

// ============================================================================
// Guards and Timeouts
// ============================================================================

#[tokio::test]
async fn test_spending_cap_notice_is_reclassified_as_billing() {
    let h = Harness::new(
        FakeRunner::new(|_, call, _| {
            if call == 1 {
                AgentOutput::succeeded("You have reached your spending cap. Resets at 5pm.", 20, 0.0)
                    .with_turns(1)
            } else {
                ok_output()
            }
        }),
        PredicateValidator::accept_all(),
        settings(3),
    )
    .await;

    let success = h
        .controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap();
    assert_eq!(success.attempt_number, 2);

    let billing = h.events.events().into_iter().find_map(|event| match event {
        PipelineEvent::AttemptFailed {
            error_kind,
            retryable,
            message,
            ..
        } => Some((error_kind, retryable, message)),
        _ => None,
    });
    let (kind, retryable, message) = billing.unwrap();
    assert_eq!(kind, "BillingError");
    assert!(retryable);
    assert!(message.contains("spending cap"));

    let doc = h.metrics.snapshot().await;
    assert_eq!(doc.agent(AgentName::Recon).unwrap().attempts[0].cost_usd, 0.0);
}

#[tokio::test]
async fn test_attempt_timeout_is_execution_limit() {
    let mut attempt_settings = settings(5);
    attempt_settings.attempt_timeout = Duration::from_millis(100);
    let h = Harness::new(
        FakeRunner::always_ok().with_delay(Duration::from_secs(5)),
        PredicateValidator::accept_all(),
        attempt_settings,
    )
    .await;

    let err = h
        .controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, AttemptError::NonRetryable { attempts: 1, .. }));
    assert_eq!(err.classified().kind, ErrorKind::ExecutionLimit);
    assert_eq!(h.runner.call_count("recon"), 1);
}

#[tokio::test]
async fn test_heartbeats_are_emitted_and_logged() {
    let mut attempt_settings = settings(1);
    attempt_settings.heartbeat_interval = Duration::from_millis(40);
    let h = Harness::with_audit(
        FakeRunner::always_ok().with_delay(Duration::from_millis(300)),
        PredicateValidator::accept_all(),
        attempt_settings,
        |root| Arc::new(FileAuditSink::new(root, "session", "https://target.test")) as Arc<dyn AuditSink>,
    )
    .await;

    h.controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap();

    let heartbeats = h
        .events
        .events()
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Heartbeat { .. }))
        .count();
    assert!(heartbeats >= 2, "only {} heartbeats", heartbeats);

    let agents_dir = h.audit_root.path().join("session").join("agents");
    let log = std::fs::read_dir(&agents_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .next()
        .unwrap();
    let content = std::fs::read_to_string(log.path()).unwrap();
    let types: Vec<String> = content
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(types.first().map(String::as_str), Some("agent_start"));
    assert_eq!(types.last().map(String::as_str), Some("agent_end"));
    assert!(types.iter().any(|t| t == "heartbeat"));
}

// ============================================================================
// Accounting
// ============================================================================

#[tokio::test]
async fn test_attempt_numbers_continue_across_runs() {
    let h = Harness::new(
        FakeRunner::new(|_, call, _| if call <= 2 { transient_failure() } else { ok_output() }),
        PredicateValidator::accept_all(),
        settings(2),
    )
    .await;

    let first = h
        .controller
        .run_with_retry(AgentName::AuthVuln, h.input(AgentName::AuthVuln), no_backoff().as_ref())
        .await;
    assert!(matches!(first, Err(AttemptError::RetriesExhausted { .. })));

    let success = h
        .controller
        .run_with_retry(AgentName::AuthVuln, h.input(AgentName::AuthVuln), no_backoff().as_ref())
        .await
        .unwrap();
    assert_eq!(success.attempt_number, 3);

    let doc = h.metrics.reload().await.unwrap();
    let agent = doc.agent(AgentName::AuthVuln).unwrap();
    let numbers: Vec<u32> = agent.attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(agent.status, AgentStatus::Success);
    assert_eq!(agent.total_cost_usd, 1.25);
}

#[tokio::test]
async fn test_succeeded_agent_cannot_run_again() {
    let h = Harness::new(
        FakeRunner::always_ok(),
        PredicateValidator::accept_all(),
        settings(2),
    )
    .await;

    h.controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap();
    let err = h
        .controller
        .run_with_retry(AgentName::Recon, h.input(AgentName::Recon), no_backoff().as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, AttemptError::Metrics { .. }));
    assert_eq!(h.runner.call_count("recon"), 1);
}

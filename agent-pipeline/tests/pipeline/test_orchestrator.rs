//! Full sessions against a fake runner that writes real deliverables

use super::common::*;
use agent_pipeline::agents::{AgentName, VulnType, DELIVERABLES_DIR};
use agent_pipeline::audit::WORKFLOW_LOG_FILE;
use agent_pipeline::metrics::{AgentStatus, SessionDocument, SESSION_FILE};
use agent_pipeline::orchestrator::{PipelineError, PipelineInput, PipelineOrchestrator};
use agent_pipeline::report::report_path;
use agent_pipeline::validator::{DeliverableValidator, CODE_ANALYSIS_FILE, RECON_FILE};
use agent_pipeline_sdk::{AgentInput, AgentOutput, BroadcastEventSink, PipelineEvent, PipelineStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

// ============================================================================
// Fixtures
// ============================================================================

/// Write what a well-behaved agent would leave behind
///
/// `queues` maps a vuln type to the number of queued findings; missing
/// entries mean an empty queue.
fn write_deliverables(agent: &str, workspace: &Path, queues: &HashMap<&str, usize>) {
    let agent: AgentName = agent.parse().unwrap();
    let deliverables = workspace.join(DELIVERABLES_DIR);
    match agent {
        AgentName::PreRecon => write_file(deliverables.join(CODE_ANALYSIS_FILE), "# Code analysis"),
        AgentName::Recon => write_file(deliverables.join(RECON_FILE), "# Recon"),
        AgentName::Report => {
            let assembled = std::fs::read_to_string(report_path(workspace)).unwrap_or_default();
            write_file(
                report_path(workspace),
                &format!(
                    "# Security Assessment\n## Executive Summary\n- Assessment Date: 2025-01-01\n\n{}",
                    assembled
                ),
            );
        }
        other => {
            let vuln = other.vuln_type().unwrap();
            if other == vuln.vuln_agent() {
                let count = queues.get(vuln.as_str()).copied().unwrap_or(0);
                let items: Vec<serde_json::Value> = (0..count)
                    .map(|i| serde_json::json!({ "ID": format!("{}-{}", vuln, i) }))
                    .collect();
                write_file(vuln.deliverable_path(workspace), "# Analysis");
                write_file(
                    vuln.queue_path(workspace),
                    &serde_json::json!({ "vulnerabilities": items }).to_string(),
                );
            } else {
                write_file(
                    vuln.evidence_path(workspace),
                    &format!("# {} evidence", vuln.as_str()),
                );
            }
        }
    }
}

/// Runner that succeeds for every agent, with xss holding one finding
fn happy_runner() -> FakeRunner {
    FakeRunner::new(|agent, _, input: &AgentInput| {
        let queues = HashMap::from([("xss", 1)]);
        write_deliverables(agent, &input.workspace_path, &queues);
        ok_output()
    })
}

struct Session {
    runner: Arc<FakeRunner>,
    events: Arc<RecordingEventSink>,
    checkpointer: Arc<RecordingCheckpointer>,
    orchestrator: PipelineOrchestrator,
    workspace: tempfile::TempDir,
    audit_root: tempfile::TempDir,
}

impl Session {
    fn new(runner: FakeRunner) -> Self {
        let workspace = tempfile::tempdir().unwrap();
        let audit_root = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner);
        let events = Arc::new(RecordingEventSink::default());
        let checkpointer = Arc::new(RecordingCheckpointer::default());

        let orchestrator = PipelineOrchestrator::new(
            test_config(audit_root.path()),
            runner.clone(),
            Arc::new(DeliverableValidator::new()),
        )
        .with_event_sink(events.clone())
        .with_checkpointer(checkpointer.clone())
        .with_backoff(no_backoff());

        Self {
            runner,
            events,
            checkpointer,
            orchestrator,
            workspace,
            audit_root,
        }
    }

    fn input(&self, session: &str, resume: bool) -> PipelineInput {
        PipelineInput {
            target: "https://target.test".to_string(),
            workspace: self.workspace.path().to_path_buf(),
            session_id: Some(session.to_string()),
            resume,
            testing: false,
        }
    }

    async fn document(&self, session: &str) -> SessionDocument {
        SessionDocument::read(&self.audit_root.path().join(session).join(SESSION_FILE))
            .await
            .unwrap()
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_full_session_completes() {
    let session = Session::new(happy_runner());
    let outcome = session
        .orchestrator
        .run(session.input("s-happy", false))
        .await
        .unwrap();

    assert_eq!(outcome.status, PipelineStatus::Completed);
    assert!(outcome.state.failed_pipelines.is_empty());
    assert!(outcome.state.failed_agent.is_none());

    // pre-recon, recon, five vuln agents, xss-exploit, report
    assert_eq!(outcome.summary.agent_count, 9);
    assert_eq!(outcome.summary.total_turns, 45);
    assert!((outcome.summary.total_cost_usd - 2.25).abs() < 1e-9);

    assert_eq!(session.runner.call_count("xss-exploit"), 1);
    for skipped in ["injection-exploit", "auth-exploit", "ssrf-exploit", "authz-exploit"] {
        assert_eq!(session.runner.call_count(skipped), 0, "{} ran", skipped);
    }

    let decisions: Vec<(String, bool)> = session
        .events
        .events()
        .into_iter()
        .filter_map(|event| match event {
            PipelineEvent::ExploitationDecided {
                work_type,
                should_exploit,
                ..
            } => Some((work_type, should_exploit)),
            _ => None,
        })
        .collect();
    assert_eq!(decisions.len(), 5);
    assert!(decisions.contains(&("xss".to_string(), true)));
    assert_eq!(decisions.iter().filter(|(_, exploit)| *exploit).count(), 1);

    let report = std::fs::read_to_string(report_path(session.workspace.path())).unwrap();
    assert!(report.contains("# xss evidence"));
    assert!(report.contains("- Assessment Date: 2025-01-01\n- Model: test-model\n"));

    let document = session.document("s-happy").await;
    assert_eq!(document.session.status, PipelineStatus::Completed);
    assert!(document.session.completed_at.is_some());
    assert_eq!(document.metrics.agents.len(), 9);
    assert_eq!(
        document.agent(AgentName::Report).unwrap().status,
        AgentStatus::Success
    );
    assert!(document.metrics.phases.contains_key("exploitation"));

    assert_eq!(session.checkpointer.count("commit:"), 9);
    let workflow_log = std::fs::read_to_string(
        session.audit_root.path().join("s-happy").join(WORKFLOW_LOG_FILE),
    )
    .unwrap();
    assert!(workflow_log.contains("[GATE] xss: exploit (1 vulnerabilities queued)"));
    assert!(workflow_log.contains("[GATE] ssrf: skip exploitation (0 vulnerabilities queued)"));
    assert_eq!(workflow_log.matches("[GATE]").count(), 5);

    let finished = session.events.events().into_iter().any(|event| {
        matches!(
            event,
            PipelineEvent::SessionFinished {
                status: PipelineStatus::Completed,
                ..
            }
        )
    });
    assert!(finished);
}

#[tokio::test]
async fn test_broadcast_subscriber_follows_session_live() {
    let workspace = tempfile::tempdir().unwrap();
    let audit_root = tempfile::tempdir().unwrap();
    let sink = Arc::new(BroadcastEventSink::new(1024));
    let mut rx = sink.subscribe();

    // Consume concurrently, stopping at the final event
    let collector = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Ok(event) = rx.recv().await {
            let done = matches!(event, PipelineEvent::SessionFinished { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    });

    let orchestrator = PipelineOrchestrator::new(
        test_config(audit_root.path()),
        Arc::new(happy_runner()),
        Arc::new(DeliverableValidator::new()),
    )
    .with_event_sink(sink.clone())
    .with_checkpointer(Arc::new(RecordingCheckpointer::default()))
    .with_backoff(no_backoff());

    let outcome = orchestrator
        .run(PipelineInput {
            target: "https://target.test".to_string(),
            workspace: workspace.path().to_path_buf(),
            session_id: Some("s-live".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.status, PipelineStatus::Completed);

    let seen = collector.await.unwrap();
    assert!(matches!(
        seen.last(),
        Some(PipelineEvent::SessionFinished { session_id, status: PipelineStatus::Completed, .. })
            if session_id == "s-live"
    ));

    let started = seen
        .iter()
        .filter(|e| matches!(e, PipelineEvent::PhaseStarted { session_id, .. } if session_id == "s-live"))
        .count();
    let completed = seen
        .iter()
        .filter(|e| matches!(e, PipelineEvent::PhaseCompleted { .. }))
        .count();
    assert!(started > 0);
    assert_eq!(started, completed);

    let agents_completed = seen
        .iter()
        .filter(|e| matches!(e, PipelineEvent::AgentCompleted { .. }))
        .count();
    // Recon pair, five vuln agents, xss exploitation, report
    assert_eq!(agents_completed, 9);
}

#[tokio::test]
async fn test_failed_sub_pipeline_does_not_stop_siblings() {
    let session = Session::new(FakeRunner::new(|agent, _, input: &AgentInput| {
        if agent == "ssrf-vuln" {
            return auth_failure();
        }
        let queues = HashMap::from([("xss", 1), ("injection", 2)]);
        write_deliverables(agent, &input.workspace_path, &queues);
        ok_output()
    }));

    let outcome = session
        .orchestrator
        .run(session.input("s-partial", false))
        .await
        .unwrap();

    assert_eq!(outcome.status, PipelineStatus::Completed);
    assert_eq!(outcome.state.failed_pipelines.len(), 1);
    assert!(outcome.state.failed_pipelines[0].contains("ssrf-vuln"));
    assert_eq!(session.runner.call_count("ssrf-vuln"), 1);
    assert_eq!(session.runner.call_count("xss-exploit"), 1);
    assert_eq!(session.runner.call_count("injection-exploit"), 1);
    assert_eq!(session.runner.call_count("report"), 1);

    let sub_failures = session
        .events
        .events()
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::SubPipelineFailed { work_type, .. } if work_type == "ssrf"))
        .count();
    assert_eq!(sub_failures, 1);

    let workflow_log = std::fs::read_to_string(
        session.audit_root.path().join("s-partial").join(WORKFLOW_LOG_FILE),
    )
    .unwrap();
    assert!(workflow_log.contains("[PIPELINE] ssrf sub-pipeline failed: ssrf-vuln"));
    assert!(!workflow_log.contains("[GATE] ssrf:"));

    let document = session.document("s-partial").await;
    assert_eq!(
        document.agent(AgentName::SsrfVuln).unwrap().status,
        AgentStatus::Failed
    );
}

#[tokio::test]
async fn test_sequential_failure_aborts_session() {
    let session = Session::new(FakeRunner::new(|agent, _, _| {
        if agent == "pre-recon" {
            auth_failure()
        } else {
            ok_output()
        }
    }));

    let outcome = session
        .orchestrator
        .run(session.input("s-abort", false))
        .await
        .unwrap();

    assert_eq!(outcome.status, PipelineStatus::Failed);
    assert_eq!(outcome.state.failed_agent.as_deref(), Some("pre-recon"));
    assert!(outcome.state.error.as_deref().unwrap().contains("pre-recon"));
    assert_eq!(session.runner.call_count("recon"), 0);
    assert_eq!(session.runner.calls().len(), 1);

    let document = session.document("s-abort").await;
    assert_eq!(document.session.status, PipelineStatus::Failed);

    let agent_failed = session
        .events
        .events()
        .into_iter()
        .any(|e| matches!(e, PipelineEvent::AgentFailed { agent, .. } if agent == "pre-recon"));
    assert!(agent_failed);
}

#[tokio::test]
async fn test_asymmetric_artifacts_exhaust_validation() {
    let session = Session::new(FakeRunner::new(|agent, _, input: &AgentInput| {
        if agent == "authz-vuln" {
            // Deliverable without its queue
            write_file(VulnType::Authz.deliverable_path(&input.workspace_path), "# Analysis");
            return ok_output();
        }
        write_deliverables(agent, &input.workspace_path, &HashMap::new());
        ok_output()
    }));

    let outcome = session
        .orchestrator
        .run(session.input("s-asym", false))
        .await
        .unwrap();

    assert_eq!(outcome.status, PipelineStatus::Completed);
    assert_eq!(session.runner.call_count("authz-vuln"), 3);
    assert_eq!(session.runner.call_count("authz-exploit"), 0);
    assert_eq!(outcome.state.failed_pipelines.len(), 1);
    assert_eq!(session.checkpointer.count("rollback:OutputValidationError"), 3);
}

#[tokio::test]
async fn test_resume_skips_completed_agents() {
    let session = Session::new(FakeRunner::new(|agent, call, input: &AgentInput| {
        if agent == "recon" && call == 1 {
            return auth_failure();
        }
        write_deliverables(agent, &input.workspace_path, &HashMap::new());
        ok_output()
    }));

    let first = session
        .orchestrator
        .run(session.input("s-resume", false))
        .await
        .unwrap();
    assert_eq!(first.status, PipelineStatus::Failed);
    assert_eq!(first.state.failed_agent.as_deref(), Some("recon"));

    let second = session
        .orchestrator
        .run(session.input("s-resume", true))
        .await
        .unwrap();
    assert_eq!(second.status, PipelineStatus::Completed);
    assert_eq!(session.runner.call_count("pre-recon"), 1);
    assert_eq!(session.runner.call_count("recon"), 2);

    let document = session.document("s-resume").await;
    let recon = document.agent(AgentName::Recon).unwrap();
    let numbers: Vec<u32> = recon.attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(recon.status, AgentStatus::Success);
    assert_eq!(document.session.status, PipelineStatus::Completed);
}

#[tokio::test]
async fn test_existing_session_requires_resume() {
    let session = Session::new(happy_runner());
    session
        .orchestrator
        .run(session.input("s-dup", false))
        .await
        .unwrap();

    let err = session
        .orchestrator
        .run(session.input("s-dup", false))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SessionExists(id) if id == "s-dup"));
}

#[tokio::test]
async fn test_progress_reports_completed_agents() {
    let session = Session::new(happy_runner());
    let run = session
        .orchestrator
        .prepare(session.input("s-progress", false))
        .await
        .unwrap();
    assert_eq!(run.session_id(), "s-progress");

    let progress = run.progress();
    let before = progress.query().await;
    assert_eq!(before.status, PipelineStatus::Running);
    assert!(before.completed_agents.is_empty());

    run.execute().await.unwrap();
    let after = progress.query().await;
    assert_eq!(after.status, PipelineStatus::Completed);
    assert!(after.completed_agents.contains(&AgentName::PreRecon));
    assert!(after.completed_agents.contains(&AgentName::Report));

    let state = progress.state().await;
    assert_eq!(state.summary.unwrap().agent_count, 9);
    assert_eq!(
        state.agent_metrics.get("recon").and_then(|m| m.model.clone()),
        Some("test-model".to_string())
    );
}

#[tokio::test]
async fn test_missing_deliverable_fails_session() {
    let session = Session::new(FakeRunner::new(|agent, _, _| {
        if agent == "pre-recon" {
            AgentOutput::succeeded("done", 10, 0.1)
        } else {
            ok_output()
        }
    }));

    // pre-recon never writes its deliverable, so validation keeps failing
    let outcome = session
        .orchestrator
        .run(session.input("s-invalid", false))
        .await
        .unwrap();
    assert_eq!(outcome.status, PipelineStatus::Failed);
    assert_eq!(session.runner.call_count("pre-recon"), 3);
    assert!(outcome
        .state
        .error
        .as_deref()
        .unwrap()
        .contains("failed output validation"));
}

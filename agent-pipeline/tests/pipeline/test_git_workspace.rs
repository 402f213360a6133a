//! Sessions checkpointing into a real git workspace

use super::common::*;
use agent_pipeline::agents::{AgentName, VulnType, DELIVERABLES_DIR};
use agent_pipeline::metrics::{SessionDocument, SESSION_FILE};
use agent_pipeline::orchestrator::{PipelineInput, PipelineOrchestrator};
use agent_pipeline::validator::{DeliverableValidator, CODE_ANALYSIS_FILE, RECON_FILE};
use agent_pipeline_sdk::{AgentInput, PipelineStatus};
use std::sync::Arc;

fn runner() -> FakeRunner {
    FakeRunner::new(|agent, call, input: &AgentInput| {
        let workspace = &input.workspace_path;
        let deliverables = workspace.join(DELIVERABLES_DIR);
        let agent: AgentName = agent.parse().unwrap();
        match agent {
            AgentName::PreRecon => write_file(deliverables.join(CODE_ANALYSIS_FILE), "# Code"),
            AgentName::Recon => write_file(deliverables.join(RECON_FILE), "# Recon"),
            AgentName::Report => {}
            AgentName::XssVuln if call == 1 => {
                // Partial output from a crashed attempt
                write_file(workspace.join("scratch.txt"), "half-written");
                return transient_failure();
            }
            other => {
                let vuln = other.vuln_type().unwrap();
                if other == vuln.vuln_agent() {
                    write_file(vuln.deliverable_path(workspace), "# Analysis");
                    write_file(vuln.queue_path(workspace), r#"{"vulnerabilities": []}"#);
                }
            }
        }
        ok_output()
    })
}

#[tokio::test]
async fn test_failed_attempt_is_rolled_back_and_success_committed() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }

    let workspace = tempfile::tempdir().unwrap();
    let audit_root = tempfile::tempdir().unwrap();
    init_test_git_repo(workspace.path());

    let mut config = test_config(audit_root.path());
    config.max_parallel_pipelines = 1;
    let runner = Arc::new(runner());
    let orchestrator =
        PipelineOrchestrator::new(config, runner.clone(), Arc::new(DeliverableValidator::new()))
            .with_backoff(no_backoff());

    let outcome = orchestrator
        .run(PipelineInput {
            target: "https://target.test".to_string(),
            workspace: workspace.path().to_path_buf(),
            session_id: Some("git-session".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(outcome.status, PipelineStatus::Completed);
    assert_eq!(runner.call_count("xss-vuln"), 2);

    // The crashed attempt's scratch file was discarded, its retry kept
    assert!(!workspace.path().join("scratch.txt").exists());
    assert!(VulnType::Xss.queue_path(workspace.path()).exists());
    assert!(run_git(workspace.path(), &["status", "--porcelain"]).is_empty());

    let log = run_git(workspace.path(), &["log", "--format=%s"]);
    assert!(log.contains("xss-vuln: completed successfully"));
    assert!(log.contains("checkpoint: xss-vuln (attempt 2)"));
    assert!(log.contains("report: completed successfully"));

    let document = SessionDocument::read(&audit_root.path().join("git-session").join(SESSION_FILE))
        .await
        .unwrap();
    let recon_hash = document
        .agent(AgentName::Recon)
        .and_then(|m| m.checkpoint.clone())
        .unwrap();
    let hashes = run_git(workspace.path(), &["log", "--format=%H"]);
    assert!(hashes.lines().any(|h| h == recon_hash));

    let report_hash = document
        .agent(AgentName::Report)
        .and_then(|m| m.checkpoint.clone())
        .unwrap();
    assert_eq!(report_hash, run_git(workspace.path(), &["rev-parse", "HEAD"]));
}

#[tokio::test]
async fn test_non_repository_workspace_still_runs() {
    let workspace = tempfile::tempdir().unwrap();
    let audit_root = tempfile::tempdir().unwrap();

    let runner = Arc::new(FakeRunner::new(|agent, _, input: &AgentInput| {
        if agent == "pre-recon" {
            write_file(
                input.workspace_path.join(DELIVERABLES_DIR).join(CODE_ANALYSIS_FILE),
                "# Code",
            );
            ok_output()
        } else {
            auth_failure()
        }
    }));
    let orchestrator = PipelineOrchestrator::new(
        test_config(audit_root.path()),
        runner.clone(),
        Arc::new(DeliverableValidator::new()),
    )
    .with_backoff(no_backoff())
    .without_audit_log();

    let outcome = orchestrator
        .run(PipelineInput {
            target: "https://target.test".to_string(),
            workspace: workspace.path().to_path_buf(),
            session_id: Some("plain".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    // Checkpointing is skipped outside a repository; the agents still run
    assert_eq!(outcome.status, PipelineStatus::Failed);
    assert_eq!(outcome.state.failed_agent.as_deref(), Some("recon"));
    assert!(outcome.state.completed_agents.contains(&AgentName::PreRecon));
    assert!(!audit_root.path().join("plain").join("workflow.log").exists());
}

//! Artifact-based output validation
//!
//! An agent's result only counts once the files it is responsible for exist
//! in the workspace.

use agent_pipeline_sdk::{async_trait, AgentOutput, OutputValidator};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::agents::{AgentName, DELIVERABLES_DIR, REPORT_FILE};
use crate::gate::QueueValidationGate;

pub const CODE_ANALYSIS_FILE: &str = "code_analysis_deliverable.md";
pub const RECON_FILE: &str = "recon_deliverable.md";

/// Checks the deliverables each agent must leave behind
#[derive(Debug, Default, Clone, Copy)]
pub struct DeliverableValidator;

impl DeliverableValidator {
    pub fn new() -> Self {
        Self
    }

    /// Required file for agents validated by existence alone
    fn required_file(agent: AgentName, workspace: &Path) -> Option<PathBuf> {
        let deliverables = workspace.join(DELIVERABLES_DIR);
        match agent {
            AgentName::PreRecon => Some(deliverables.join(CODE_ANALYSIS_FILE)),
            AgentName::Recon => Some(deliverables.join(RECON_FILE)),
            AgentName::Report => Some(deliverables.join(REPORT_FILE)),
            AgentName::InjectionExploit
            | AgentName::XssExploit
            | AgentName::AuthExploit
            | AgentName::SsrfExploit
            | AgentName::AuthzExploit => agent.vuln_type().map(|v| v.evidence_path(workspace)),
            _ => None,
        }
    }
}

#[async_trait]
impl OutputValidator for DeliverableValidator {
    async fn validate(&self, agent_id: &str, workspace_path: &Path, result: &AgentOutput) -> bool {
        let has_text = result
            .result_text
            .as_deref()
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false);
        if !result.success || !has_text {
            debug!(agent = agent_id, "Rejecting unsuccessful or empty result");
            return false;
        }

        let agent: AgentName = match agent_id.parse() {
            Ok(agent) => agent,
            Err(e) => {
                warn!("No validator for agent: {}", e);
                return false;
            }
        };

        // Analysis agents must leave a consistent deliverable/queue pair
        if let Some(vuln) = agent.vuln_type().filter(|v| v.vuln_agent() == agent) {
            return match QueueValidationGate::decide(vuln, workspace_path).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(%agent, "Deliverable validation failed: {}", e);
                    false
                }
            };
        }

        match Self::required_file(agent, workspace_path) {
            Some(path) => {
                let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
                if !exists {
                    warn!(%agent, "Missing required deliverable: {}", path.display());
                }
                exists
            }
            None => false,
        }
    }
}

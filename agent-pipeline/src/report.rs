//! Final report assembly
//!
//! Before the report agent runs, the exploitation evidence of every
//! sub-pipeline is stitched into one markdown document the agent then
//! refines. Afterwards the models used during the session are stamped into
//! its executive summary.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::agents::{VulnType, DELIVERABLES_DIR, REPORT_FILE};
use crate::metrics::SessionDocument;

pub fn report_path(workspace: &Path) -> PathBuf {
    workspace.join(DELIVERABLES_DIR).join(REPORT_FILE)
}

/// Concatenate every existing evidence file into the report, in
/// [`VulnType::ALL`] order separated by a blank line
///
/// Missing or unreadable evidence is skipped. Returns the assembled text.
pub async fn assemble_final_report(workspace: &Path) -> Result<String> {
    let mut sections = Vec::new();

    for vuln in VulnType::ALL {
        let path = vuln.evidence_path(workspace);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                debug!(%vuln, "Added findings to report");
                sections.push(content);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(%vuln, "No evidence deliverable found");
            }
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
            }
        }
    }

    let content = sections.join("\n\n");
    let dir = workspace.join(DELIVERABLES_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let path = report_path(workspace);
    tokio::fs::write(&path, &content)
        .await
        .with_context(|| format!("Failed to write final report: {}", path.display()))?;

    info!(sections = sections.len(), "Final report assembled at {}", path.display());
    Ok(content)
}

/// Insert a `- Model: ...` line after `- Assessment Date:`, or else right
/// under `## Executive Summary`
///
/// Returns `Ok(false)` when there is nothing to inject or nowhere to put it.
pub async fn inject_model_metadata(workspace: &Path, document: &SessionDocument) -> Result<bool> {
    let models: BTreeSet<&str> = document
        .metrics
        .agents
        .values()
        .filter_map(|m| m.model.as_deref())
        .collect();
    if models.is_empty() {
        debug!("No model information recorded, skipping report metadata");
        return Ok(false);
    }

    let path = report_path(workspace);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        warn!("Final report not found, skipping model injection");
        return Ok(false);
    }
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let model_line = format!(
        "- Model: {}",
        models.into_iter().collect::<Vec<_>>().join(", ")
    );
    let Some(updated) = insert_model_line(&content, &model_line) else {
        warn!("Could not find Executive Summary section in report");
        return Ok(false);
    };

    tokio::fs::write(&path, updated)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

fn insert_model_line(content: &str, model_line: &str) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    let anchor = lines
        .iter()
        .position(|line| line.starts_with("- Assessment Date: "))
        .or_else(|| {
            lines
                .iter()
                .position(|line| line.trim_end() == "## Executive Summary")
        })?;

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    out.extend_from_slice(&lines[..=anchor]);
    out.push(model_line);
    out.extend_from_slice(&lines[anchor + 1..]);

    let mut updated = out.join("\n");
    if content.ends_with('\n') {
        updated.push('\n');
    }
    Some(updated)
}

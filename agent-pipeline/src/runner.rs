//! Process-backed agent runner
//!
//! Each attempt spawns the configured command inside the workspace, writes
//! the [`AgentInput`] as JSON to its stdin and expects an [`AgentOutput`]
//! JSON object on the last non-empty line of stdout.

use agent_pipeline_sdk::{async_trait, AgentInput, AgentOutput, AgentRunner};
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Lines of stderr kept when a process fails without a result
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct ProcessAgentRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessAgentRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn build_command(&self, input: &AgentInput) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&input.workspace_path)
            .envs(&input.env_overrides)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // An attempt that times out drops this future; take the child with it
            .kill_on_drop(true);
        cmd
    }

    async fn invoke(&self, input: &AgentInput) -> Result<AgentOutput> {
        let payload = serde_json::to_vec(input).context("Failed to serialize agent input")?;

        let mut child = self
            .build_command(input)
            .spawn()
            .with_context(|| format!("Failed to spawn agent process {}", self.program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("Failed to write agent input")?;
            // Closing stdin signals end of input
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for agent process")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            program = %self.program.display(),
            status = %output.status,
            stdout_bytes = output.stdout.len(),
            "Agent process exited"
        );

        match parse_last_json_line(&stdout) {
            Some(parsed) => parsed,
            None if output.status.success() => {
                Err(anyhow!("Agent process produced no JSON result on stdout"))
            }
            None => Err(anyhow!(
                "Agent process exited with {}: {}",
                output.status,
                stderr_tail(&stderr)
            )),
        }
    }
}

/// Parse the last non-empty stdout line, `None` when stdout is empty
fn parse_last_json_line(stdout: &str) -> Option<Result<AgentOutput>> {
    let line = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    Some(serde_json::from_str(line.trim()).context("Failed to parse agent output JSON"))
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(&self, input: AgentInput) -> AgentOutput {
        let started = Instant::now();
        match self.invoke(&input).await {
            Ok(mut output) => {
                if output.duration_ms == 0 {
                    output.duration_ms = started.elapsed().as_millis() as u64;
                }
                output
            }
            Err(e) => {
                warn!(program = %self.program.display(), "Agent process failed: {:#}", e);
                let mut output = AgentOutput::failed(format!("{:#}", e));
                output.duration_ms = started.elapsed().as_millis() as u64;
                output
            }
        }
    }
}

use agent_pipeline::checkpoint::NoopCheckpointer;
use agent_pipeline::config::{default_audit_root, PipelineConfig};
use agent_pipeline::metrics::{SessionDocument, SESSION_FILE};
use agent_pipeline::orchestrator::{PipelineInput, PipelineOrchestrator};
use agent_pipeline::runner::ProcessAgentRunner;
use agent_pipeline::validator::DeliverableValidator;
use agent_pipeline_sdk::{PipelineStatus, StderrEventSink};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "agent-pipeline")]
#[command(about = "Run checkpointed multi-phase agent pipelines against a target")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full pipeline session
    Run {
        /// Target URL
        #[arg(long)]
        target: String,

        /// Shared workspace (ideally a git repository)
        #[arg(long)]
        workspace: PathBuf,

        /// Agent runner executable
        #[arg(long)]
        runner: PathBuf,

        /// Extra argument for the runner (repeatable)
        #[arg(long = "runner-arg", allow_hyphen_values = true)]
        runner_args: Vec<String>,

        /// YAML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Audit log root (overrides config)
        #[arg(long)]
        audit_root: Option<PathBuf>,

        /// Session id (generated when omitted)
        #[arg(long)]
        session_id: Option<String>,

        /// Resume an existing session
        #[arg(long, requires = "session_id")]
        resume: bool,

        /// Use the short testing retry preset
        #[arg(long)]
        testing: bool,

        /// Do not checkpoint or roll back the workspace
        #[arg(long)]
        no_checkpoint: bool,
    },

    /// Show a persisted session
    Status {
        /// Session id
        #[arg(long)]
        session: String,

        /// Audit log root
        #[arg(long)]
        audit_root: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agent_pipeline=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            target,
            workspace,
            runner,
            runner_args,
            config,
            audit_root,
            session_id,
            resume,
            testing,
            no_checkpoint,
        } => {
            let mut config = match config {
                Some(path) => PipelineConfig::load(&path)?,
                None => PipelineConfig::default(),
            };
            if audit_root.is_some() {
                config.audit_root = audit_root;
            }
            let workspace = workspace
                .canonicalize()
                .with_context(|| format!("Workspace not found: {}", workspace.display()))?;

            let mut orchestrator = PipelineOrchestrator::new(
                config,
                Arc::new(ProcessAgentRunner::new(runner).with_args(runner_args)),
                Arc::new(DeliverableValidator::new()),
            )
            .with_event_sink(Arc::new(StderrEventSink));
            if no_checkpoint {
                orchestrator = orchestrator.with_checkpointer(Arc::new(NoopCheckpointer));
            }

            let outcome = orchestrator
                .run(PipelineInput {
                    target,
                    workspace,
                    session_id,
                    resume,
                    testing,
                })
                .await?;

            println!("Session:   {}", outcome.session_id);
            println!("Status:    {}", outcome.status.as_str());
            println!("Duration:  {}ms", outcome.summary.total_duration_ms);
            println!("Cost:      ${:.4}", outcome.summary.total_cost_usd);
            println!("Turns:     {}", outcome.summary.total_turns);
            println!("Agents:    {}", outcome.summary.agent_count);
            for failure in &outcome.state.failed_pipelines {
                println!("Sub-pipeline failed: {}", failure);
            }

            if outcome.status == PipelineStatus::Failed {
                bail!(
                    "Pipeline failed: {}",
                    outcome.state.error.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(())
        }

        Command::Status {
            session,
            audit_root,
        } => {
            let root = audit_root.unwrap_or_else(default_audit_root);
            let path = root.join(&session).join(SESSION_FILE);
            let document = SessionDocument::read(&path)
                .await
                .with_context(|| format!("No session document for {}", session))?;
            print_status(&document);
            Ok(())
        }
    }
}

fn print_status(document: &SessionDocument) {
    let session = &document.session;
    let metrics = &document.metrics;

    println!("Session:   {}", session.id);
    println!("Target:    {}", session.target);
    println!("Status:    {}", session.status.as_str());
    println!("Created:   {}", session.created_at.to_rfc3339());
    if let Some(completed_at) = session.completed_at {
        println!("Completed: {}", completed_at.to_rfc3339());
    }
    println!("Duration:  {}ms", metrics.total_duration_ms);
    println!("Cost:      ${:.4}", metrics.total_cost_usd);

    if !metrics.phases.is_empty() {
        println!("\nPhases:");
        for (name, phase) in &metrics.phases {
            println!(
                "  {:<24} {:>8}ms {:>6.1}%  ${:.4}  ({} agents)",
                name, phase.duration_ms, phase.duration_pct, phase.cost_usd, phase.agent_count
            );
        }
    }

    if !metrics.agents.is_empty() {
        println!("\nAgents:");
        for (name, agent) in &metrics.agents {
            println!(
                "  {:<24} {:<12} attempts={}  ${:.4}",
                name,
                format!("{:?}", agent.status),
                agent.attempts.len(),
                agent.total_cost_usd
            );
        }
    }
}

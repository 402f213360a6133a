//! Resilient orchestration of multi-phase agent pipelines
//!
//! Agents run against a shared, git-checkpointed workspace with bounded,
//! classification-driven retries and crash-safe session metrics. The entry
//! point is [`orchestrator::PipelineOrchestrator`].

// Agent catalog
pub mod agents;

// Ambient configuration
pub mod config;

// Failure taxonomy and backoff
pub mod classifier;

// Cross-process file locks
pub mod lock;

// Workspace checkpoint/rollback
pub mod checkpoint;

// Exploitation gate
pub mod gate;

// Session metrics document
pub mod metrics;

// Audit trail
pub mod audit;

// Per-agent retry loop
pub mod attempt;

// Bounded fan-out
pub mod batch;

// Live progress
pub mod progress;

// Collaborator implementations
pub mod runner;
pub mod validator;

// Final report assembly
pub mod report;

// Phase sequencing
pub mod orchestrator;

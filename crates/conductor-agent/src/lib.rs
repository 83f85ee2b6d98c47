//! Workflow engine for Conductor.
//!
//! This crate is the orchestration core: it classifies a request, plans it
//! into steps, runs or delegates each step, holds risky or uncertain work for
//! a human, and finally synthesizes one answer.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────┐
//!   request ────> │  Engine  │ <──── resolve / retry / cancel
//!                 └────┬─────┘
//!                      │ Router::next(state)
//!      ┌───────────┬───┴────────┬─────────────┬────────────┐
//!      v           v            v             v            v
//!  Classifier   Planner    Coordinator      Gates      Aggregator
//!      │           │        │       │         │            │
//!      └───────────┴────────┤  StepExecutor   │            │
//!                  Oracle <─┘       │         └─> Checkpoint│Store
//!                                MessageBus ──> Workers
//!                                   │
//!                               TaskStore
//! ```
//!
//! ## Modules
//!
//! - [`state`] -- `WorkflowState`, `StateUpdate` and the per-field reducers.
//! - [`router`] -- `Stage` and the routing function.
//! - [`classifier`], [`planner`], [`executor`], [`coordinator`],
//!   [`aggregator`] -- the executable stages.
//! - [`gates`] -- human decisions and the prompts that ask for them.
//! - [`policy`] -- approval keywords and worker selection.
//! - [`engine`] -- the run loop, pending table and checkpoints.
//! - [`workers`] -- oracle-backed worker endpoints.
//! - [`llm`] -- the `Oracle` seam and its HTTP client.
//! - [`config`] -- layered TOML / environment configuration.
//! - [`error`] -- workflow error types.

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gates;
pub mod llm;
pub mod planner;
pub mod policy;
pub mod router;
pub mod state;
pub mod workers;

// Re-export the most commonly used types at the crate root.
pub use config::{EngineConfig, WorkerConfig};
pub use engine::{Engine, EngineBuilder, PendingRequest, PendingStatus, RunOutcome, oracle_from_config};
pub use error::{Result, WorkflowError};
pub use executor::{ExecutorConfig, StepExecutor, StepOutcome};
pub use gates::{
    ApprovalDecision, ClarificationDecision, ContextDecision, Decision, GatePrompt, apply_decision,
    prompt_for,
};
pub use llm::{LlmClient, LlmClientConfig, LlmOracle, LlmProvider, Oracle, RetryPolicy, RetryingOracle, ScriptedOracle};
pub use planner::{Planner, PlannerConfig};
pub use policy::{ApprovalPolicy, SelectionSource, WorkerChoice, WorkerSelector};
pub use router::{Router, Stage};
pub use state::{
    ApprovalReason, ApprovalRequest, Confidence, PlanStep, StateUpdate, TaskCheckpoint, WorkflowState,
};
pub use workers::OracleWorker;

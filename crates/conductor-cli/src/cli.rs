//! CLI argument definitions for Conductor.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Conductor -- multi-step workflow orchestration across specialized workers.
#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Conductor -- workflow orchestration with human-in-the-loop gates",
    long_about = "Classifies a request, plans it into steps, delegates each step to the \
                  worker that owns it, and pauses for a human when a step changes data \
                  or the answer is uncertain."
)]
pub struct Cli {
    /// Configuration file merged over the built-in defaults.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a workflow for a request.
    Ask {
        /// The request text.
        request: String,

        /// Enable human-in-the-loop gates for this run.
        #[arg(long, conflicts_with = "no_hitl")]
        hitl: bool,

        /// Disable human-in-the-loop gates for this run.
        #[arg(long)]
        no_hitl: bool,
    },

    /// Answer a workflow that is waiting for a human.
    Resolve {
        /// Instance id printed when the workflow was suspended.
        instance_id: String,

        action: Action,

        /// Replacement step text, guidance or context.
        #[arg(long, short)]
        text: Option<String>,
    },

    /// Re-run the stage a failed workflow stopped at.
    Retry {
        instance_id: String,
    },

    /// List suspended and failed workflows.
    Pending,

    /// Discard a suspended or failed workflow.
    Cancel {
        instance_id: String,
    },

    /// Show the tasks recorded for a worker.
    Tasks {
        /// Worker id, e.g. HR.
        #[arg(required_unless_present = "clear")]
        worker_id: Option<String>,

        /// Delete every recorded task instead.
        #[arg(long)]
        clear: bool,
    },

    /// Delete tasks older than the given age.
    Expire {
        /// Age in hours; defaults to `store.task_ttl_hours`.
        #[arg(long)]
        hours: Option<u64>,
    },

    /// List the configured workers.
    Workers,
}

/// Reply actions accepted by `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    Approve,
    Modify,
    Skip,
    Replan,
    Continue,
    Guidance,
    Context,
}

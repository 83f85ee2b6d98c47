//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, decision parsing and outcome printing.

use anyhow::{Result, bail};
use conductor_agent::{
    ApprovalDecision, ClarificationDecision, ContextDecision, Decision, RunOutcome, Stage,
};
use tracing_subscriber::EnvFilter;

use crate::cli::Action;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Build the decision for `action` at `gate`.  `replan` exists at two gates,
/// so the gate picks the variant.
pub fn decision_for(gate: Stage, action: Action, text: Option<String>) -> Result<Decision> {
    let need_text = |what: &str| match text.clone().filter(|t| !t.trim().is_empty()) {
        Some(text) => Ok(text),
        None => bail!("`{what}` needs --text"),
    };

    let decision = match (action, gate) {
        (Action::Approve, _) => Decision::Approval(ApprovalDecision::Approve),
        (Action::Modify, _) => Decision::Approval(ApprovalDecision::Modify {
            text: need_text("modify")?,
        }),
        (Action::Skip, _) => Decision::Approval(ApprovalDecision::Skip),
        (Action::Replan, Stage::ClarificationGate) => {
            Decision::Clarification(ClarificationDecision::Replan)
        }
        (Action::Replan, _) => Decision::Approval(ApprovalDecision::Replan),
        (Action::Continue, _) => Decision::Clarification(ClarificationDecision::Continue),
        (Action::Guidance, _) => Decision::Clarification(ClarificationDecision::Guidance {
            text: need_text("guidance")?,
        }),
        (Action::Context, _) => Decision::Context(ContextDecision {
            context: need_text("context")?,
        }),
    };
    Ok(decision)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

pub fn print_outcome(outcome: &RunOutcome) {
    println!();
    match outcome {
        RunOutcome::Completed { answer, .. } => {
            println!("{answer}");
        }
        RunOutcome::Suspended {
            instance_id,
            gate,
            prompt,
        } => {
            println!("  Waiting for a human ({gate}).");
            println!("  {}", prompt.message);
            println!();
            println!("  Instance: {instance_id}");
            println!("  Reply with: conductor resolve {instance_id} <{}>", prompt.options.join("|"));
        }
        RunOutcome::Failed {
            instance_id,
            stage,
            reason,
        } => {
            println!("  Workflow failed at {stage}: {reason}");
            println!();
            println!("  Instance: {instance_id}");
            println!("  Retry with: conductor retry {instance_id}");
        }
    }
    println!();
}

/// Shorten `text` to at most `max` characters for table output.
pub fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        return line.to_owned();
    }
    let cut: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

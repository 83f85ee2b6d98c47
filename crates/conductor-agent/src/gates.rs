//! Human-in-the-loop gates.
//!
//! A gate is where a run stops and waits for a person.  The engine suspends
//! the instance and hands out a [`GatePrompt`]; the reply comes back as a
//! [`Decision`] whose variant must match the gate that asked for it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};
use crate::llm::types::Message;
use crate::router::Stage;
use crate::state::{Confidence, StateUpdate, WorkflowState};

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    /// Replace the held step's text; it is checked again on the next pass.
    Modify { text: String },
    Skip,
    Replan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClarificationDecision {
    /// Accept the situation and re-attempt the step.
    Continue,
    Guidance { text: String },
    Replan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDecision {
    pub context: String,
}

/// A human reply to a suspended instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum Decision {
    Approval(ApprovalDecision),
    Clarification(ClarificationDecision),
    Context(ContextDecision),
}

impl Decision {
    /// The gate this decision answers.
    pub fn gate(&self) -> Stage {
        match self {
            Self::Approval(_) => Stage::ApprovalGate,
            Self::Clarification(_) => Stage::ClarificationGate,
            Self::Context(_) => Stage::ContextGate,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Approval(_) => "approval",
            Self::Clarification(_) => "clarification",
            Self::Context(_) => "context",
        }
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// What a suspended instance is asking its human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePrompt {
    pub gate: Stage,
    pub message: String,
    /// Accepted reply actions, e.g. `approve`, `modify`.
    pub options: Vec<String>,
}

impl fmt::Display for GatePrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message, self.options.join("|"))
    }
}

/// Describe what `gate` needs from a human, given the suspended state.
pub fn prompt_for(gate: Stage, state: &WorkflowState) -> GatePrompt {
    let (message, options): (String, &[&str]) = match gate {
        Stage::ApprovalGate => {
            let message = match &state.pending_approval {
                Some(req) => format!(
                    "Approval required ({}) for step {}: {}",
                    req.reason,
                    req.step_index + 1,
                    req.step_text
                ),
                None => "Approval required".to_owned(),
            };
            (message, &["approve", "modify", "skip", "replan"][..])
        }
        Stage::ClarificationGate => {
            let confidence = state
                .confidence_score
                .map_or_else(|| "?".to_owned(), |c| c.to_string());
            (
                format!(
                    "Low confidence ({confidence}) on step {}; guidance needed",
                    state.current_step + 1
                ),
                &["continue", "guidance", "replan"][..],
            )
        }
        Stage::ContextGate => (
            "Additional context is needed to proceed".to_owned(),
            &["context"][..],
        ),
        other => (format!("{other} does not wait for input"), &[][..]),
    };

    GatePrompt {
        gate,
        message,
        options: options.iter().map(|s| (*s).to_owned()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Applying decisions
// ---------------------------------------------------------------------------

/// Turn a decision into a state update for the instance suspended at `gate`.
///
/// Fails with [`WorkflowError::GateMismatch`] when the decision answers a
/// different gate.
pub fn apply_decision(gate: Stage, state: &WorkflowState, decision: &Decision) -> Result<StateUpdate> {
    let update = match (gate, decision) {
        (Stage::ApprovalGate, Decision::Approval(d)) => approval(state, d)?,
        (Stage::ClarificationGate, Decision::Clarification(d)) => clarification(state, d),
        (Stage::ContextGate, Decision::Context(d)) => StateUpdate::new()
            .needs_context(false)
            .human_input(d.context.clone())
            .message(Message::system(format!("Context added: {}", d.context))),
        _ => {
            return Err(WorkflowError::GateMismatch {
                expected: gate.to_string(),
                got: decision.kind().to_owned(),
            });
        }
    };
    tracing::info!(%gate, decision = decision.kind(), "human decision applied");
    Ok(update)
}

fn approval(state: &WorkflowState, decision: &ApprovalDecision) -> Result<StateUpdate> {
    let Some(pending) = &state.pending_approval else {
        return Err(WorkflowError::Internal(
            "approval gate reached without a pending request".into(),
        ));
    };
    let index = pending.step_index;

    let update = match decision {
        ApprovalDecision::Approve => StateUpdate::new().approve(index).clear_approval(),
        ApprovalDecision::Modify { text } => {
            let mut plan = state.plan.clone();
            match plan.get_mut(index) {
                Some(step) => step.text = text.clone(),
                None => {
                    return Err(WorkflowError::Internal(format!(
                        "approval refers to missing plan step {index}"
                    )));
                }
            }
            StateUpdate::new().plan(plan).clear_approval()
        }
        ApprovalDecision::Skip => StateUpdate::new()
            .step(index + 1)
            .clear_approval()
            .message(Message::system(format!("Step {} skipped", index + 1))),
        ApprovalDecision::Replan => StateUpdate::new().clear_approval().waiting_for_human(true),
    };
    Ok(update)
}

/// Continue and Guidance accept the held step: its next run completes
/// whatever confidence the oracle reports.
fn clarification(state: &WorkflowState, decision: &ClarificationDecision) -> StateUpdate {
    let index = state.current_step;
    match decision {
        ClarificationDecision::Continue => StateUpdate::new()
            .waiting_for_human(false)
            .accept(index)
            .confidence(Confidence::MAX),
        ClarificationDecision::Guidance { text } => StateUpdate::new()
            .waiting_for_human(false)
            .accept(index)
            .human_input(text.clone())
            .confidence(Confidence::MAX),
        ClarificationDecision::Replan => StateUpdate::new()
            .waiting_for_human(false)
            .needs_context(true),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Stage routing.
//!
//! The engine is a small state machine: after every stage the [`Router`]
//! inspects the state and names the next [`Stage`].  Rules are evaluated in
//! order and the first match wins:
//!
//! 1. not yet classified            -> `Classify`
//! 2. classified simple             -> `Simple`
//! 3. request names a direct worker -> `DirectDelegate`
//! 4. no plan yet                   -> `CreatePlan`
//! 5. (HITL only) pending approval  -> `ApprovalGate`
//! 6. (HITL only) waiting for human -> `ClarificationGate`
//! 7. (HITL only) needs context     -> `ContextGate`
//! 8. steps remain                  -> `Coordinate`
//! 9. otherwise                     -> `Aggregate`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::policy::WorkerSelector;
use crate::state::WorkflowState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    Simple,
    DirectDelegate,
    CreatePlan,
    Coordinate,
    ApprovalGate,
    ClarificationGate,
    ContextGate,
    Aggregate,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Classify,
        Stage::Simple,
        Stage::DirectDelegate,
        Stage::CreatePlan,
        Stage::Coordinate,
        Stage::ApprovalGate,
        Stage::ClarificationGate,
        Stage::ContextGate,
        Stage::Aggregate,
    ];

    /// A terminal stage finishes the run after it executes.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Simple | Self::DirectDelegate | Self::Aggregate)
    }

    /// A gate suspends the run until a human decision arrives.
    pub fn is_gate(self) -> bool {
        matches!(
            self,
            Self::ApprovalGate | Self::ClarificationGate | Self::ContextGate
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Simple => "simple",
            Self::DirectDelegate => "direct_delegate",
            Self::CreatePlan => "create_plan",
            Self::Coordinate => "coordinate",
            Self::ApprovalGate => "approval_gate",
            Self::ClarificationGate => "clarification_gate",
            Self::ContextGate => "context_gate",
            Self::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| WorkflowError::Internal(format!("unknown stage `{s}`")))
    }
}

/// Chooses the next stage from the current state.
#[derive(Clone)]
pub struct Router {
    hitl_enabled: bool,
    selector: WorkerSelector,
}

impl Router {
    pub fn new(hitl_enabled: bool, selector: WorkerSelector) -> Self {
        Self {
            hitl_enabled,
            selector,
        }
    }

    pub fn hitl_enabled(&self) -> bool {
        self.hitl_enabled
    }

    pub fn next(&self, state: &WorkflowState) -> Stage {
        match state.is_complex {
            None => return Stage::Classify,
            Some(false) => return Stage::Simple,
            Some(true) => {}
        }

        // A direct delegation held for approval carries a one-step plan and
        // continues through the gates like any planned step.
        if state.plan.is_empty() {
            if self.selector.direct_target(state.latest_request()).is_some() {
                return Stage::DirectDelegate;
            }
            return Stage::CreatePlan;
        }

        if self.hitl_enabled {
            if state.pending_approval.is_some() {
                return Stage::ApprovalGate;
            }
            if state.waiting_for_human {
                return Stage::ClarificationGate;
            }
            if state.needs_context {
                return Stage::ContextGate;
            }
        }

        if state.is_plan_finished() {
            Stage::Aggregate
        } else {
            Stage::Coordinate
        }
    }
}

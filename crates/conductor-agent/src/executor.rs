//! Step executor.
//!
//! Runs one plan step through the oracle and judges the answer by the
//! confidence the oracle reports.  Destructive steps are held for approval
//! before any oracle call is made.

use std::sync::Arc;

use regex::Regex;

use crate::error::Result;
use crate::llm::Oracle;
use crate::llm::types::Message;
use crate::policy::ApprovalPolicy;
use crate::state::{ApprovalRequest, Confidence, StateUpdate, WorkflowState};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Answers scoring below this wait for a human.
    pub confidence_threshold: Confidence,
    /// How many recent history entries go into the prompt.
    pub context_window: usize,
    /// With HITL off nothing is held for approval and low confidence only
    /// logs a warning.
    pub hitl_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: Confidence::new(70),
            context_window: 3,
            hitl_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    NeedsApproval(ApprovalRequest),
    Completed { answer: String, confidence: Confidence },
    LowConfidence { answer: String, confidence: Confidence },
}

/// What happened, plus the state change that records it.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub outcome: StepOutcome,
    pub update: StateUpdate,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct StepExecutor {
    oracle: Arc<dyn Oracle>,
    policy: ApprovalPolicy,
    config: ExecutorConfig,
    confidence: Regex,
}

impl StepExecutor {
    pub fn new(oracle: Arc<dyn Oracle>, policy: ApprovalPolicy, config: ExecutorConfig) -> Result<Self> {
        Ok(Self {
            oracle,
            policy,
            config,
            confidence: Regex::new(r"(?i)Confidence:\s*(\d+)\s*%?")?,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute the step under the cursor, using its text verbatim.
    pub async fn execute_current(&self, state: &WorkflowState) -> Result<StepExecution> {
        let index = state.current_step;
        let text = state
            .current_plan_step()
            .map(|s| s.text.clone())
            .unwrap_or_default();
        self.execute(state, index, &text).await
    }

    /// Execute step `index` with the given task text.
    pub async fn execute(&self, state: &WorkflowState, index: usize, text: &str) -> Result<StepExecution> {
        let number = index + 1;

        if self.config.hitl_enabled
            && let Some(request) = self.policy.check(state, index, text)
        {
            tracing::info!(step = number, reason = %request.reason, "step held for approval");
            return Ok(StepExecution {
                update: StateUpdate::new().request_approval(request.clone()),
                outcome: StepOutcome::NeedsApproval(request),
            });
        }

        tracing::info!(step = number, "executing step");
        let raw = self.oracle.complete(&self.build_prompt(state, text)).await?;
        let (confidence, answer) = self.parse_answer(&raw);

        if confidence < self.config.confidence_threshold {
            if state.accepted_steps.contains(&index) {
                tracing::info!(step = number, %confidence, "low confidence accepted by a human");
            } else if self.config.hitl_enabled {
                tracing::info!(step = number, %confidence, "low confidence, asking for clarification");
                return Ok(StepExecution {
                    update: StateUpdate::new()
                        .waiting_for_human(true)
                        .confidence(confidence)
                        .message(Message::assistant(format!(
                            "Step {number} - Low confidence ({confidence}): {answer}"
                        ))),
                    outcome: StepOutcome::LowConfidence { answer, confidence },
                });
            } else {
                tracing::warn!(step = number, %confidence, "low confidence with HITL disabled, continuing");
            }
        }

        Ok(StepExecution {
            update: StateUpdate::new()
                .step(index + 1)
                .confidence(confidence)
                .clear_human_input()
                .message(Message::assistant(format!("Step {number} completed: {answer}"))),
            outcome: StepOutcome::Completed { answer, confidence },
        })
    }

    fn build_prompt(&self, state: &WorkflowState, text: &str) -> String {
        let context = state
            .recent_history(self.config.context_window)
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut prompt = format!(
            "Execute this step of the plan.\n\n\
             Step: \"{text}\"\n\n\
             Context from earlier steps:\n{context}\n"
        );
        if let Some(guidance) = &state.human_input {
            prompt.push_str(&format!("\nHuman guidance: {guidance}\n"));
        }
        prompt.push_str(
            "\nRate your confidence (0-100) that you completed the step correctly, \
             then give your answer.\nFormat: \"Confidence: <score>\" on the first line, \
             then a blank line, then the answer.",
        );
        prompt
    }

    /// Split the oracle answer into its confidence score and the answer text.
    /// A missing or unreadable score counts as full confidence.
    pub fn parse_answer(&self, raw: &str) -> (Confidence, String) {
        let Some(caps) = self.confidence.captures(raw) else {
            return (Confidence::MAX, raw.trim().to_owned());
        };
        let score = caps[1]
            .parse::<u32>()
            .map(Confidence::new)
            .unwrap_or(Confidence::MAX);

        let span = caps.get(0).map_or(0..0, |m| m.range());
        let mut answer = String::with_capacity(raw.len());
        answer.push_str(&raw[..span.start]);
        answer.push_str(&raw[span.end..]);
        (score, answer.trim().to_owned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

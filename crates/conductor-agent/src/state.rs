//! Workflow state and the partial-update reducer.
//!
//! A stage never mutates [`WorkflowState`] directly: it returns a
//! [`StateUpdate`] describing what changed, and [`WorkflowState::apply`]
//! merges it.  Merge rules per field:
//!
//! | field                               | rule                                   |
//! |-------------------------------------|----------------------------------------|
//! | `history`, `agent_messages`         | append                                 |
//! | `approved_steps`, `accepted_steps`  | set union                              |
//! | `tasks`                             | upsert by id, first position kept      |
//! | `agent_responses`, `task_checkpoints` | map merge, incoming key wins         |
//! | `plan`                              | replaced only by a non-empty plan      |
//! | `pending_approval`, `human_input`   | [`Patch`]: keep, set, or clear         |
//! | everything else                     | incoming value wins when present       |
//!
//! Applying [`StateUpdate::default()`] is the identity.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use conductor_kernel::AgentMessage;
use conductor_store::Task;
use serde::{Deserialize, Serialize};

use crate::llm::types::{Message, Role};

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// One line of a plan: what to do and, optionally, who should do it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
}

impl PlanStep {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            assigned_worker: None,
        }
    }

    pub fn assigned(worker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            assigned_worker: Some(worker.into()),
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.assigned_worker {
            Some(worker) => write!(f, "[{worker}] {}", self.text),
            None => f.write_str(&self.text),
        }
    }
}

/// Self-reported answer confidence, always within `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct Confidence(u8);

impl Confidence {
    pub const MAX: Self = Self(100);

    /// Clamps values above 100.
    pub fn new(value: u32) -> Self {
        Self(value.min(100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl From<u32> for Confidence {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<Confidence> for u32 {
    fn from(c: Confidence) -> Self {
        u32::from(c.0)
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalReason {
    /// The step looks like it changes stored data.
    DbChange,
}

impl fmt::Display for ApprovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DbChange => f.write_str("db-change"),
        }
    }
}

/// A plan step held back until a human approves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub step_index: usize,
    pub step_text: String,
    pub reason: ApprovalReason,
}

/// Completion marker recorded per delegated task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub completed: bool,
    pub timestamp: DateTime<Utc>,
}

impl TaskCheckpoint {
    pub fn now(completed: bool) -> Self {
        Self {
            completed,
            timestamp: Utc::now(),
        }
    }
}

/// Three-way update for an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Patch<T> {
    fn apply_to(self, slot: &mut Option<T>) {
        match self {
            Self::Keep => {}
            Self::Set(value) => *slot = Some(value),
            Self::Clear => *slot = None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Everything one workflow instance knows.  Serializable so a suspended
/// instance can be checkpointed and resumed in another process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub history: Vec<Message>,
    /// `None` until the classifier has run.
    pub is_complex: Option<bool>,
    pub plan: Vec<PlanStep>,
    pub current_step: usize,
    pub pending_approval: Option<ApprovalRequest>,
    pub approved_steps: BTreeSet<usize>,
    /// Steps whose low-confidence answer a human chose to accept.
    #[serde(default)]
    pub accepted_steps: BTreeSet<usize>,
    pub waiting_for_human: bool,
    pub needs_context: bool,
    pub confidence_score: Option<Confidence>,
    pub human_input: Option<String>,
    pub tasks: Vec<Task>,
    pub agent_messages: Vec<AgentMessage>,
    pub agent_responses: BTreeMap<String, String>,
    pub task_checkpoints: BTreeMap<String, TaskCheckpoint>,
    pub current_worker: Option<String>,
}

impl WorkflowState {
    /// A fresh instance whose history holds the user request.
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            history: vec![Message::user(request)],
            ..Self::default()
        }
    }

    /// Merge `update` into `self` following the field rules above.
    pub fn apply(&mut self, update: StateUpdate) {
        self.history.extend(update.history);
        if let Some(is_complex) = update.is_complex {
            self.is_complex = Some(is_complex);
        }
        if !update.plan.is_empty() {
            self.plan = update.plan;
        }
        if let Some(step) = update.current_step {
            self.current_step = step;
        }
        update.pending_approval.apply_to(&mut self.pending_approval);
        self.approved_steps.extend(update.approved_steps);
        self.accepted_steps.extend(update.accepted_steps);
        if let Some(waiting) = update.waiting_for_human {
            self.waiting_for_human = waiting;
        }
        if let Some(needs) = update.needs_context {
            self.needs_context = needs;
        }
        if let Some(score) = update.confidence_score {
            self.confidence_score = Some(score);
        }
        update.human_input.apply_to(&mut self.human_input);
        for task in update.tasks {
            match self.tasks.iter_mut().find(|t| t.id == task.id) {
                Some(existing) => *existing = task,
                None => self.tasks.push(task),
            }
        }
        self.agent_messages.extend(update.agent_messages);
        self.agent_responses.extend(update.agent_responses);
        self.task_checkpoints.extend(update.task_checkpoints);
        if let Some(worker) = update.current_worker {
            self.current_worker = Some(worker);
        }
    }

    /// The first user message: the request that started the instance.
    pub fn original_request(&self) -> &str {
        self.history
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    /// The most recent user message.
    pub fn latest_request(&self) -> &str {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    pub fn current_plan_step(&self) -> Option<&PlanStep> {
        self.plan.get(self.current_step)
    }

    pub fn is_plan_finished(&self) -> bool {
        self.current_step >= self.plan.len()
    }

    /// The last `n` history entries, oldest first.
    pub fn recent_history(&self, n: usize) -> &[Message] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// The last assistant message, if any.
    pub fn final_answer(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    /// Distinct worker ids that ran a task, in first-seen order.
    pub fn contributing_workers(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for task in &self.tasks {
            if !seen.contains(&task.assigned_worker.as_str()) {
                seen.push(&task.assigned_worker);
            }
        }
        seen
    }
}

// ---------------------------------------------------------------------------
// StateUpdate
// ---------------------------------------------------------------------------

/// A partial state change produced by one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub history: Vec<Message>,
    pub is_complex: Option<bool>,
    pub plan: Vec<PlanStep>,
    pub current_step: Option<usize>,
    pub pending_approval: Patch<ApprovalRequest>,
    pub approved_steps: Vec<usize>,
    pub accepted_steps: Vec<usize>,
    pub waiting_for_human: Option<bool>,
    pub needs_context: Option<bool>,
    pub confidence_score: Option<Confidence>,
    pub human_input: Patch<String>,
    pub tasks: Vec<Task>,
    pub agent_messages: Vec<AgentMessage>,
    pub agent_responses: BTreeMap<String, String>,
    pub task_checkpoints: BTreeMap<String, TaskCheckpoint>,
    pub current_worker: Option<String>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn message(mut self, message: Message) -> Self {
        self.history.push(message);
        self
    }

    pub fn classified(mut self, is_complex: bool) -> Self {
        self.is_complex = Some(is_complex);
        self
    }

    pub fn plan(mut self, plan: Vec<PlanStep>) -> Self {
        self.plan = plan;
        self
    }

    pub fn step(mut self, index: usize) -> Self {
        self.current_step = Some(index);
        self
    }

    pub fn request_approval(mut self, request: ApprovalRequest) -> Self {
        self.pending_approval = Patch::Set(request);
        self
    }

    pub fn clear_approval(mut self) -> Self {
        self.pending_approval = Patch::Clear;
        self
    }

    pub fn approve(mut self, step_index: usize) -> Self {
        self.approved_steps.push(step_index);
        self
    }

    /// Stop escalating low confidence on `step_index`.
    pub fn accept(mut self, step_index: usize) -> Self {
        self.accepted_steps.push(step_index);
        self
    }

    pub fn waiting_for_human(mut self, waiting: bool) -> Self {
        self.waiting_for_human = Some(waiting);
        self
    }

    pub fn needs_context(mut self, needs: bool) -> Self {
        self.needs_context = Some(needs);
        self
    }

    pub fn confidence(mut self, score: Confidence) -> Self {
        self.confidence_score = Some(score);
        self
    }

    pub fn human_input(mut self, input: impl Into<String>) -> Self {
        self.human_input = Patch::Set(input.into());
        self
    }

    pub fn clear_human_input(mut self) -> Self {
        self.human_input = Patch::Clear;
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn agent_message(mut self, message: AgentMessage) -> Self {
        self.agent_messages.push(message);
        self
    }

    pub fn response(mut self, task_id: impl Into<String>, text: impl Into<String>) -> Self {
        self.agent_responses.insert(task_id.into(), text.into());
        self
    }

    pub fn checkpoint(mut self, task_id: impl Into<String>, checkpoint: TaskCheckpoint) -> Self {
        self.task_checkpoints.insert(task_id.into(), checkpoint);
        self
    }

    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.current_worker = Some(worker_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_holds_request() {
        let state = WorkflowState::new("What is 2+2?");
        assert_eq!(state.history, vec![Message::user("What is 2+2?")]);
        assert_eq!(state.original_request(), "What is 2+2?");
        assert!(state.is_complex.is_none());
        assert!(state.is_plan_finished());
    }

    #[test]
    fn history_and_messages_append() {
        let mut state = WorkflowState::new("q");
        state.apply(StateUpdate::new().message(Message::assistant("a1")));
        state.apply(StateUpdate::new().message(Message::assistant("a2")));
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.final_answer(), Some("a2"));
    }

    #[test]
    fn empty_plan_does_not_replace() {
        let mut state = WorkflowState::new("q");
        state.apply(StateUpdate::new().plan(vec![PlanStep::new("one")]));
        state.apply(StateUpdate::new().plan(Vec::new()).step(1));
        assert_eq!(state.plan, vec![PlanStep::new("one")]);
        assert_eq!(state.current_step, 1);
    }

    #[test]
    fn approved_steps_union() {
        let mut state = WorkflowState::new("q");
        state.apply(StateUpdate::new().approve(0).approve(2));
        state.apply(StateUpdate::new().approve(2).approve(1));
        assert_eq!(state.approved_steps.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn tasks_upsert_in_place() {
        let mut state = WorkflowState::new("q");
        let first = Task::new("step_0_HR", "HR", "count").with_id("t1");
        let second = Task::new("step_1_FPA", "FPA", "budget").with_id("t2");
        state.apply(StateUpdate::new().task(first.clone()).task(second));

        let mut done = first;
        done.complete("42");
        state.apply(StateUpdate::new().task(done));

        assert_eq!(state.tasks.len(), 2);
        assert_eq!(state.tasks[0].id, "t1");
        assert_eq!(state.tasks[0].result.as_deref(), Some("42"));
        assert_eq!(state.contributing_workers(), vec!["HR", "FPA"]);
    }

    #[test]
    fn response_maps_merge_last_write_wins() {
        let mut state = WorkflowState::new("q");
        state.apply(StateUpdate::new().response("t1", "first").response("t2", "other"));
        state.apply(StateUpdate::new().response("t1", "second"));
        assert_eq!(state.agent_responses["t1"], "second");
        assert_eq!(state.agent_responses["t2"], "other");
    }

    #[test]
    fn patch_keeps_sets_and_clears() {
        let request = ApprovalRequest {
            step_index: 0,
            step_text: "Delete inactive records".into(),
            reason: ApprovalReason::DbChange,
        };
        let mut state = WorkflowState::new("q");
        state.apply(StateUpdate::new().request_approval(request.clone()));
        state.apply(StateUpdate::new().step(0));
        assert_eq!(state.pending_approval.as_ref(), Some(&request));
        state.apply(StateUpdate::new().clear_approval());
        assert!(state.pending_approval.is_none());
    }

    #[test]
    fn empty_update_is_identity() {
        let mut state = WorkflowState::new("q");
        state.apply(
            StateUpdate::new()
                .plan(vec![PlanStep::assigned("HR", "count staff")])
                .confidence(Confidence::new(40))
                .human_input("be precise"),
        );
        let before = state.clone();
        state.apply(StateUpdate::default());
        assert_eq!(state, before);
        assert!(StateUpdate::default().is_empty());
    }

    #[test]
    fn confidence_clamps_and_serializes_as_number() {
        assert_eq!(Confidence::new(250).value(), 100);
        assert_eq!(serde_json::to_value(Confidence::new(65)).unwrap(), 65);
        let back: Confidence = serde_json::from_value(serde_json::json!(140)).unwrap();
        assert_eq!(back, Confidence::MAX);
    }

    #[test]
    fn approval_reason_wire_name() {
        assert_eq!(serde_json::to_value(ApprovalReason::DbChange).unwrap(), "db-change");
        assert_eq!(ApprovalReason::DbChange.to_string(), "db-change");
    }

    #[test]
    fn state_survives_json_round_trip() {
        let mut state = WorkflowState::new("Delete inactive records");
        state.apply(
            StateUpdate::new()
                .classified(true)
                .plan(vec![PlanStep::assigned("HR", "Delete inactive records")])
                .checkpoint("t1", TaskCheckpoint::now(true))
                .worker("HR"),
        );
        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn plan_step_display_shows_tag() {
        assert_eq!(PlanStep::assigned("FPA", "Q3 budget").to_string(), "[FPA] Q3 budget");
        assert_eq!(PlanStep::new("Summarize").to_string(), "Summarize");
    }
}

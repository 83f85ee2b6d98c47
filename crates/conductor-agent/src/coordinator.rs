//! Step coordination and delegation.
//!
//! The coordinator owns the `Coordinate` and `DirectDelegate` stages.  For
//! each plan step it resolves a worker; the orchestrator's own steps run
//! through the [`StepExecutor`], everything else is delegated over the
//! [`MessageBus`] and tracked as a [`Task`] in the injected [`TaskStore`].

use std::sync::Arc;

use conductor_kernel::{AgentMessage, Delivery, MessageBus, MessageKind};
use conductor_store::{Task, TaskStore};
use serde_json::json;

use crate::error::Result;
use crate::executor::{StepExecutor, StepOutcome};
use crate::llm::types::Message;
use crate::policy::{ApprovalPolicy, WorkerSelector};
use crate::state::{PlanStep, StateUpdate, TaskCheckpoint, WorkflowState};

pub struct Coordinator {
    selector: WorkerSelector,
    bus: MessageBus,
    tasks: Arc<dyn TaskStore>,
    executor: Arc<StepExecutor>,
    policy: ApprovalPolicy,
    hitl_enabled: bool,
}

/// A finished delegation: the task record and the exchanged messages.
struct Delegated {
    task: Task,
    delivery: Delivery,
}

impl Coordinator {
    pub fn new(
        selector: WorkerSelector,
        bus: MessageBus,
        tasks: Arc<dyn TaskStore>,
        executor: Arc<StepExecutor>,
        policy: ApprovalPolicy,
        hitl_enabled: bool,
    ) -> Self {
        Self {
            selector,
            bus,
            tasks,
            executor,
            policy,
            hitl_enabled,
        }
    }

    /// Run or delegate the step under the cursor.
    pub async fn coordinate(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let index = state.current_step;
        let Some(step) = state.current_plan_step() else {
            tracing::warn!(index, plan_len = state.plan.len(), "cursor past the end of the plan");
            return Ok(StateUpdate::new()
                .step(state.plan.len())
                .message(Message::assistant(format!("Error: no plan step at index {index}"))));
        };

        let choice = self.selector.select(step);
        tracing::info!(
            step = index + 1,
            worker = %choice.worker_id,
            source = ?choice.source,
            "step assigned"
        );

        if self.selector.is_orchestrator(&choice.worker_id) {
            return self.run_locally(state, index, &choice.task_text).await;
        }

        let profile = self.selector.registry().get(&choice.worker_id)?;
        if self.hitl_enabled
            && profile.hitl_enabled
            && let Some(request) = self.policy.check(state, index, &choice.task_text)
        {
            tracing::info!(step = index + 1, worker = %profile.id, "delegated step held for approval");
            return Ok(StateUpdate::new().request_approval(request));
        }

        let content = with_guidance(&choice.task_text, state.human_input.as_deref());
        let done = self
            .delegate(
                &profile.id,
                format!("step_{index}_{}", profile.id),
                &choice.task_text,
                content,
                Some(index),
                interruptions(state, index),
            )
            .await?;

        let summary = format!(
            "Step {} - Delegated to {}: {}",
            index + 1,
            profile.name,
            done.delivery.response_text()
        );
        Ok(record(done)
            .step(index + 1)
            .clear_human_input()
            .message(Message::assistant(summary)))
    }

    /// Send the whole request to the worker named by the direct keywords.
    ///
    /// A destructive request for a worker with approval gates becomes a
    /// one-step plan assigned to that worker, held at step 0.
    pub async fn direct(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let request = state.latest_request();
        let worker = match self.selector.direct_target(request) {
            Some(worker) => worker,
            None => self.selector.select_for_text(request).worker_id,
        };

        let profile = self.selector.registry().get(&worker)?;
        if self.hitl_enabled
            && profile.hitl_enabled
            && let Some(approval) = self.policy.check(state, 0, request)
        {
            tracing::info!(worker = %worker, "direct request held for approval");
            return Ok(StateUpdate::new()
                .plan(vec![PlanStep::assigned(worker, request)])
                .step(0)
                .request_approval(approval));
        }
        tracing::info!(worker = %worker, "delegating request directly");

        let done = self
            .delegate(&worker, format!("direct_{worker}"), request, request.to_owned(), None, Vec::new())
            .await?;
        let answer = done.delivery.response_text().to_owned();
        Ok(record(done).message(Message::assistant(answer)))
    }

    /// The orchestrator's own step: execute it here, and on success keep a
    /// task record so the aggregator sees the result.
    async fn run_locally(&self, state: &WorkflowState, index: usize, text: &str) -> Result<StateUpdate> {
        let execution = self.executor.execute(state, index, text).await?;
        let StepOutcome::Completed { answer, .. } = &execution.outcome else {
            return Ok(execution.update);
        };

        let orchestrator = self.selector.orchestrator();
        let mut task = Task::new(format!("step_{index}_{orchestrator}"), orchestrator, text);
        task.checkpoint = Some(json!({ "step_index": index }));
        task.interruptions = interruptions(state, index);
        task.complete(answer.clone());
        self.tasks.put(orchestrator, &task).await?;

        Ok(execution
            .update
            .response(task.id.clone(), answer.clone())
            .checkpoint(task.id.clone(), TaskCheckpoint::now(true))
            .worker(orchestrator)
            .task(task))
    }

    async fn delegate(
        &self,
        worker_id: &str,
        name: String,
        description: &str,
        content: String,
        step_index: Option<usize>,
        interruptions: Vec<String>,
    ) -> Result<Delegated> {
        let mut task = Task::new(name, worker_id, description);
        task.checkpoint = step_index.map(|i| json!({ "step_index": i }));
        for reason in interruptions {
            task.interrupt(reason);
        }
        self.tasks.put(worker_id, &task).await?;

        let message = AgentMessage::new(
            self.selector.orchestrator(),
            worker_id,
            content,
            MessageKind::Delegation,
        )
        .with_task_id(task.id.clone());
        let delivery = self.bus.dispatch(message).await;

        if delivery.is_error() {
            tracing::warn!(task_id = %task.id, worker = worker_id, response = delivery.response_text(), "delegation failed");
            task.fail(delivery.response_text());
        } else {
            tracing::info!(task_id = %task.id, worker = worker_id, "delegation completed");
            task.complete(delivery.response_text());
        }
        self.tasks.put(worker_id, &task).await?;

        Ok(Delegated { task, delivery })
    }
}

/// Fold a delegation into a state update (cursor untouched).
fn record(done: Delegated) -> StateUpdate {
    let Delegated { task, delivery } = done;
    let completed = !delivery.is_error();
    let text = delivery.response.content.clone();
    StateUpdate::new()
        .response(task.id.clone(), text)
        .checkpoint(task.id.clone(), TaskCheckpoint::now(completed))
        .worker(task.assigned_worker.clone())
        .agent_message(delivery.request)
        .agent_message(delivery.response)
        .task(task)
}

/// Human pauses that step `index` went through before it ran.
fn interruptions(state: &WorkflowState, index: usize) -> Vec<String> {
    let mut out = Vec::new();
    if state.approved_steps.contains(&index) {
        out.push("approval".to_owned());
    }
    if state.accepted_steps.contains(&index) {
        out.push("low confidence accepted".to_owned());
    }
    out
}

fn with_guidance(text: &str, guidance: Option<&str>) -> String {
    match guidance {
        Some(g) => format!("{text}\n\nHuman guidance: {g}"),
        None => text.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

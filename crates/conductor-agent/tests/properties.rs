//! Property tests for the state reducers and the router.

use std::sync::Arc;

use async_trait::async_trait;
use conductor_agent::llm::Message;
use conductor_agent::{
    ApprovalReason, ApprovalRequest, Confidence, PlanStep, Router, Stage, StateUpdate, WorkerSelector,
    WorkflowState,
};
use conductor_kernel::{Worker, WorkerProfile, WorkerRegistry, WorkerRequest};
use proptest::prelude::*;

struct Silent;

#[async_trait]
impl Worker for Silent {
    async fn handle(&self, _request: &WorkerRequest) -> conductor_kernel::Result<String> {
        Ok(String::new())
    }
}

fn router(hitl: bool) -> Router {
    let registry = WorkerRegistry::new();
    registry.register(
        WorkerProfile::new("zAI", "zAI Orchestrator").with_multi_step_planning(true),
        Arc::new(Silent),
    );
    registry.register(WorkerProfile::new("HR", "HR Agent").with_hitl(true), Arc::new(Silent));
    let selector = WorkerSelector::builder(registry, "zAI")
        .keywords("HR", ["employee", "staff"])
        .direct_keywords("HR", ["salary", "employee"])
        .build()
        .unwrap();
    Router::new(hitl, selector)
}

fn message() -> impl Strategy<Value = Message> {
    (0..3u8, "[a-z ]{0,24}").prop_map(|(role, text)| match role {
        0 => Message::system(text),
        1 => Message::user(text),
        _ => Message::assistant(text),
    })
}

fn plan_step() -> impl Strategy<Value = PlanStep> {
    (
        "[a-z ]{1,20}",
        prop::option::of(prop::sample::select(vec!["zAI", "HR", "FPA"])),
    )
        .prop_map(|(text, worker)| match worker {
            Some(worker) => PlanStep::assigned(worker, text),
            None => PlanStep::new(text),
        })
}

fn state() -> impl Strategy<Value = WorkflowState> {
    (
        prop::collection::vec(message(), 0..6),
        prop::option::of(any::<bool>()),
        prop::collection::vec(plan_step(), 0..5),
        0..6usize,
        prop::collection::btree_set(0..5usize, 0..3),
        any::<bool>(),
        any::<bool>(),
        prop::option::of(0..=100u32),
        prop::option::of((0..5usize, "[a-z ]{1,12}")),
        prop::option::of("[a-z ]{1,12}"),
    )
        .prop_map(
            |(history, is_complex, plan, step, approved, waiting, context, confidence, pending, input)| {
                let mut state = WorkflowState {
                    history,
                    is_complex,
                    current_step: step.min(plan.len()),
                    plan,
                    approved_steps: approved,
                    waiting_for_human: waiting,
                    needs_context: context,
                    confidence_score: confidence.map(Confidence::new),
                    human_input: input,
                    ..WorkflowState::default()
                };
                state.pending_approval = pending.map(|(index, text)| ApprovalRequest {
                    step_index: index,
                    step_text: text,
                    reason: ApprovalReason::DbChange,
                });
                state
            },
        )
}

proptest! {
    #[test]
    fn empty_update_is_identity(original in state()) {
        let mut state = original.clone();
        state.apply(StateUpdate::new());
        prop_assert_eq!(state, original);
    }

    #[test]
    fn simple_classification_always_routes_to_simple(mut state in state(), hitl in any::<bool>()) {
        state.is_complex = Some(false);
        // Direct keywords must not win over the classification.
        state.history.push(Message::user("what is my salary"));
        prop_assert_eq!(router(hitl).next(&state), Stage::Simple);
    }

    #[test]
    fn unclassified_always_routes_to_classify(mut state in state(), hitl in any::<bool>()) {
        state.is_complex = None;
        prop_assert_eq!(router(hitl).next(&state), Stage::Classify);
    }

    #[test]
    fn gates_are_only_reached_with_hitl(mut state in state()) {
        state.is_complex = Some(true);
        prop_assert!(!router(false).next(&state).is_gate());
    }

    #[test]
    fn approved_steps_only_grow(mut state in state(), extra in prop::collection::btree_set(0..8usize, 0..4)) {
        let before = state.approved_steps.clone();
        let mut update = StateUpdate::new();
        for index in &extra {
            update = update.approve(*index);
        }
        state.apply(update);
        prop_assert!(before.is_subset(&state.approved_steps));
        prop_assert!(extra.is_subset(&state.approved_steps));
    }
}

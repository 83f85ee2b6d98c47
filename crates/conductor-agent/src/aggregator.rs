//! Final answer synthesis.

use std::sync::Arc;

use conductor_kernel::WorkerRegistry;

use crate::error::Result;
use crate::llm::Oracle;
use crate::llm::types::Message;
use crate::state::{StateUpdate, WorkflowState};

/// Combines every collected worker response into one answer once the plan
/// is exhausted.
pub struct Aggregator {
    oracle: Arc<dyn Oracle>,
    registry: WorkerRegistry,
    orchestrator: String,
}

impl Aggregator {
    pub fn new(oracle: Arc<dyn Oracle>, registry: WorkerRegistry, orchestrator: impl Into<String>) -> Self {
        Self {
            oracle,
            registry,
            orchestrator: orchestrator.into(),
        }
    }

    pub async fn aggregate(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let name = self.display_name(&self.orchestrator);
        let answer = self.oracle.complete(&self.build_prompt(state, &name)).await?;
        tracing::info!(responses = state.agent_responses.len(), "final answer aggregated");
        Ok(StateUpdate::new().message(Message::assistant(format!(
            "[{name} Final Result] {}",
            answer.trim()
        ))))
    }

    fn display_name(&self, worker_id: &str) -> String {
        self.registry
            .get(worker_id)
            .map(|p| p.name)
            .unwrap_or_else(|_| worker_id.to_owned())
    }

    fn build_prompt(&self, state: &WorkflowState, name: &str) -> String {
        let plan = state
            .plan
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {step}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");

        // Responses in task order; the map itself is keyed by id.
        let responses = state
            .tasks
            .iter()
            .filter_map(|task| {
                state
                    .agent_responses
                    .get(&task.id)
                    .map(|text| format!("- {} ({}): {text}", task.assigned_worker, task.name))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let contributors = state
            .contributing_workers()
            .into_iter()
            .map(|id| self.display_name(id))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "You are {name}, the orchestrator. You split a request into steps and \
             collected the results below.\n\n\
             Original request: \"{request}\"\n\n\
             Plan:\n{plan}\n\n\
             Worker responses:\n{responses}\n\n\
             Contributing workers: {contributors}\n\n\
             Write one complete, concise answer to the original request that \
             synthesizes these responses and names the workers that contributed.",
            request = state.original_request(),
        )
    }
}

#[cfg(test)]
mod tests {
    use conductor_store::Task;

    use super::*;
    use crate::llm::ScriptedOracle;
    use crate::state::PlanStep;

    #[tokio::test]
    async fn answer_is_labelled_and_prompt_lists_everything() {
        let oracle = Arc::new(ScriptedOracle::new().otherwise("  All three steps done. "));
        let aggregator = Aggregator::new(oracle.clone(), WorkerRegistry::new(), "zAI");

        let mut state = WorkflowState::new("Quarterly review");
        let mut update = StateUpdate::new().classified(true).step(2).plan(vec![
            PlanStep::assigned("HR", "Headcount"),
            PlanStep::assigned("FPA", "Budget"),
        ]);
        for (worker, text) in [("HR", "42 staff"), ("FPA", "$1.2M")] {
            let task = Task::new(format!("step_{worker}"), worker, "x");
            update = update.response(task.id.clone(), text).task(task);
        }
        state.apply(update);

        let mut state_after = state.clone();
        state_after.apply(aggregator.aggregate(&state).await.unwrap());
        assert_eq!(
            state_after.final_answer(),
            Some("[zAI Final Result] All three steps done.")
        );

        let prompt = &oracle.prompts()[0];
        assert!(prompt.contains("Original request: \"Quarterly review\""));
        assert!(prompt.contains("1. [HR] Headcount"));
        assert!(prompt.contains("- HR (step_HR): 42 staff"));
        assert!(prompt.contains("- FPA (step_FPA): $1.2M"));
        assert!(prompt.contains("Contributing workers: HR, FPA"));
    }
}

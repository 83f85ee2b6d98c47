//! Plan generation.
//!
//! Asks the oracle to break a complex request into a short numbered list of
//! steps, each tagged with the worker that should run it.  The planner only
//! trusts lines that look like `N. ...`; everything else in the answer is
//! ignored.

use std::sync::Arc;

use conductor_kernel::WorkerRegistry;
use regex::Regex;

use crate::error::Result;
use crate::llm::Oracle;
use crate::llm::types::Message;
use crate::state::{PlanStep, StateUpdate, WorkflowState};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Worker that takes untagged steps.
    pub orchestrator: String,
    /// Upper bound on steps requested from the oracle; extra lines are dropped.
    pub max_steps: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            orchestrator: "zAI".into(),
            max_steps: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

pub struct Planner {
    oracle: Arc<dyn Oracle>,
    registry: WorkerRegistry,
    config: PlannerConfig,
    numbered: Regex,
    agent_tag: Regex,
    bare_tag: Regex,
}

impl Planner {
    pub fn new(oracle: Arc<dyn Oracle>, registry: WorkerRegistry, config: PlannerConfig) -> Result<Self> {
        Ok(Self {
            oracle,
            registry,
            config,
            numbered: Regex::new(r"^\d+\.\s*")?,
            agent_tag: Regex::new(r"(?i)^\[Agent:\s*(\w+)\]\s*-\s*(.+)$")?,
            bare_tag: Regex::new(r"^\[(\w+)\]\s*(.+)$")?,
        })
    }

    /// Produce a plan for the latest request and reset the cursor.
    pub async fn create_plan(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let request = state.latest_request();
        let prompt = self.build_prompt(request);
        tracing::debug!(prompt_len = prompt.len(), "requesting plan");

        let answer = self.oracle.complete(&prompt).await?;
        let mut plan = self.parse_plan(&answer);
        if plan.is_empty() {
            tracing::warn!("no plan lines in oracle answer, falling back to a single step");
            plan.push(PlanStep::assigned(&self.config.orchestrator, request));
        }

        tracing::info!(steps = plan.len(), "plan created");

        let listing = plan
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {step}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(StateUpdate::new()
            .plan(plan)
            .step(0)
            .message(Message::assistant(format!(
                "I'll handle this request step by step:\n\n{listing}"
            ))))
    }

    fn build_prompt(&self, request: &str) -> String {
        let workers = self
            .registry
            .list_all()
            .into_iter()
            .map(|w| {
                let mut line = format!("- {} ({}): {}", w.id, w.name, w.capabilities.join(", "));
                if !w.description.is_empty() {
                    line.push_str(&format!(". {}", w.description));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Create a concise, actionable plan for this request, assigning each step \
             to the worker best suited for it.\n\n\
             Request: \"{request}\"\n\n\
             Available workers:\n{workers}\n\n\
             Use {orchestrator} for general tasks and coordination.\n\
             Respond with at most {max} numbered steps, one per line, in exactly this format:\n\
             1. [Agent: WORKER_ID] - step description\n\
             2. [Agent: WORKER_ID] - step description",
            orchestrator = self.config.orchestrator,
            max = self.config.max_steps,
        )
    }

    /// Keep numbered lines, strip the numbering and read the worker tag.
    pub fn parse_plan(&self, text: &str) -> Vec<PlanStep> {
        text.lines()
            .map(str::trim)
            .filter_map(|line| {
                let m = self.numbered.find(line)?;
                let body = line[m.end()..].trim();
                (!body.is_empty()).then_some(body)
            })
            .map(|body| self.parse_step(body))
            .take(self.config.max_steps)
            .collect()
    }

    fn parse_step(&self, body: &str) -> PlanStep {
        let caps = self
            .agent_tag
            .captures(body)
            .or_else(|| self.bare_tag.captures(body));
        match caps {
            Some(caps) => PlanStep::assigned(&caps[1], caps[2].trim()),
            None => PlanStep::assigned(&self.config.orchestrator, body),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedOracle;

    fn planner(oracle: ScriptedOracle) -> Planner {
        Planner::new(Arc::new(oracle), WorkerRegistry::new(), PlannerConfig::default()).unwrap()
    }

    #[test]
    fn parses_agent_tags_and_skips_prose() {
        let p = planner(ScriptedOracle::new());
        let plan = p.parse_plan(
            "Here is the plan:\n\
             1. [Agent: HR] - Pull headcount by department\n\
             2. [agent: FPA] - Compute cost per head\n\
             Some commentary.\n\
             3. Summarize findings",
        );
        assert_eq!(
            plan,
            vec![
                PlanStep::assigned("HR", "Pull headcount by department"),
                PlanStep::assigned("FPA", "Compute cost per head"),
                PlanStep::assigned("zAI", "Summarize findings"),
            ]
        );
    }

    #[test]
    fn accepts_bare_tags() {
        let p = planner(ScriptedOracle::new());
        assert_eq!(
            p.parse_plan("1. [FPA] Quarterly burn rate"),
            vec![PlanStep::assigned("FPA", "Quarterly burn rate")]
        );
    }

    #[test]
    fn caps_step_count() {
        let p = planner(ScriptedOracle::new());
        let text = (1..=6).map(|i| format!("{i}. step {i}")).collect::<Vec<_>>().join("\n");
        assert_eq!(p.parse_plan(&text).len(), 4);
    }

    #[tokio::test]
    async fn empty_parse_falls_back_to_single_step() {
        let p = planner(ScriptedOracle::new().otherwise("I cannot plan this."));
        let update = p
            .create_plan(&WorkflowState::new("Reconcile the ledgers"))
            .await
            .unwrap();
        assert_eq!(update.plan, vec![PlanStep::assigned("zAI", "Reconcile the ledgers")]);
        assert_eq!(update.current_step, Some(0));
        assert_eq!(update.history.len(), 1);
    }

    #[tokio::test]
    async fn prompt_lists_registered_workers() {
        use async_trait::async_trait;
        use conductor_kernel::{Worker, WorkerProfile, WorkerRequest};

        struct Noop;
        #[async_trait]
        impl Worker for Noop {
            async fn handle(&self, _r: &WorkerRequest) -> conductor_kernel::Result<String> {
                Ok(String::new())
            }
        }

        let registry = WorkerRegistry::new();
        registry.register(
            WorkerProfile::new("HR", "HR Agent").with_capabilities(["employee_data", "hiring"]),
            Arc::new(Noop),
        );
        let oracle = Arc::new(ScriptedOracle::new().otherwise("1. [Agent: HR] - Count staff"));
        let p = Planner::new(oracle.clone(), registry, PlannerConfig::default()).unwrap();
        p.create_plan(&WorkflowState::new("How many staff?")).await.unwrap();

        let prompt = &oracle.prompts()[0];
        assert!(prompt.contains("- HR (HR Agent): employee_data, hiring"));
        assert!(prompt.contains("at most 4 numbered steps"));
    }
}

//! Worker selection and the destructive-step approval policy.
//!
//! Both are keyword driven and share the kernel's [`KeywordMatcher`], so
//! matching is case-insensitive.  Worker keywords match at word starts; the
//! approval keywords match anywhere, so "Recreate" and "reinsert" are held.

use conductor_kernel::{KeywordMatcher, WorkerRegistry};
use regex::Regex;

use crate::error::Result;
use crate::state::{ApprovalReason, ApprovalRequest, PlanStep, WorkflowState};

/// Words that mark a step as changing stored data.
pub const DEFAULT_APPROVAL_KEYWORDS: [&str; 8] = [
    "create", "insert", "update", "delete", "drop", "alter", "modify", "remove",
];

// ---------------------------------------------------------------------------
// Approval policy
// ---------------------------------------------------------------------------

/// Decides which plan steps must wait for human approval.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    matcher: KeywordMatcher,
}

impl ApprovalPolicy {
    pub fn new<I, S>(keywords: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            matcher: KeywordMatcher::builder()
                .rule(ApprovalReason::DbChange.to_string(), keywords)
                .match_anywhere()
                .build()?,
        })
    }

    pub fn with_default_keywords() -> Result<Self> {
        Self::new(DEFAULT_APPROVAL_KEYWORDS)
    }

    pub fn is_destructive(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }

    /// An approval request for step `index`, unless it is already approved
    /// or harmless.
    pub fn check(&self, state: &WorkflowState, index: usize, text: &str) -> Option<ApprovalRequest> {
        if state.approved_steps.contains(&index) || !self.is_destructive(text) {
            return None;
        }
        Some(ApprovalRequest {
            step_index: index,
            step_text: text.to_owned(),
            reason: ApprovalReason::DbChange,
        })
    }
}

// ---------------------------------------------------------------------------
// Worker selection
// ---------------------------------------------------------------------------

/// How a step's worker was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    /// `assigned_worker` was set by the planner.
    Assigned,
    /// The step text began with a `[Worker]` tag.
    Tagged,
    Keyword,
    /// Nothing matched; the orchestrator takes the step.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerChoice {
    pub worker_id: String,
    /// Step text with any leading `[Worker]` tag removed.
    pub task_text: String,
    pub source: SelectionSource,
}

/// Resolves plan steps and requests to registered workers.
#[derive(Clone)]
pub struct WorkerSelector {
    registry: WorkerRegistry,
    orchestrator: String,
    keywords: KeywordMatcher,
    direct: KeywordMatcher,
    tag: Regex,
}

impl WorkerSelector {
    pub fn builder(registry: WorkerRegistry, orchestrator: impl Into<String>) -> WorkerSelectorBuilder {
        WorkerSelectorBuilder {
            registry,
            orchestrator: orchestrator.into(),
            keywords: Vec::new(),
            direct: Vec::new(),
        }
    }

    pub fn orchestrator(&self) -> &str {
        &self.orchestrator
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Pick the worker for a plan step: explicit assignment or tag (when
    /// registered), then keywords, then the orchestrator.
    pub fn select(&self, step: &PlanStep) -> WorkerChoice {
        if let Some(worker) = &step.assigned_worker
            && self.registry.contains(worker)
        {
            return WorkerChoice {
                worker_id: worker.clone(),
                task_text: step.text.clone(),
                source: SelectionSource::Assigned,
            };
        }

        if let Some(caps) = self.tag.captures(&step.text)
            && self.registry.contains(&caps[1])
        {
            return WorkerChoice {
                worker_id: caps[1].to_owned(),
                task_text: caps[2].trim().to_owned(),
                source: SelectionSource::Tagged,
            };
        }

        self.select_for_text(&step.text)
    }

    /// Keyword lookup over free text, falling back to the orchestrator.
    pub fn select_for_text(&self, text: &str) -> WorkerChoice {
        match self.keywords.find(text) {
            Some(hit) if self.registry.contains(&hit.target) => WorkerChoice {
                worker_id: hit.target,
                task_text: text.to_owned(),
                source: SelectionSource::Keyword,
            },
            _ => WorkerChoice {
                worker_id: self.orchestrator.clone(),
                task_text: text.to_owned(),
                source: SelectionSource::Default,
            },
        }
    }

    /// The single-purpose worker a request should go straight to, if any.
    pub fn direct_target(&self, request: &str) -> Option<String> {
        self.direct
            .find(request)
            .map(|hit| hit.target)
            .filter(|id| self.registry.contains(id))
    }

    pub fn is_orchestrator(&self, worker_id: &str) -> bool {
        worker_id == self.orchestrator
    }
}

pub struct WorkerSelectorBuilder {
    registry: WorkerRegistry,
    orchestrator: String,
    keywords: Vec<(String, Vec<String>)>,
    direct: Vec<(String, Vec<String>)>,
}

impl WorkerSelectorBuilder {
    /// Keywords that route a plan step to `worker_id`.  Earlier rules win.
    pub fn keywords<I, S>(mut self, worker_id: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords
            .push((worker_id.into(), keywords.into_iter().map(Into::into).collect()));
        self
    }

    /// Keywords that send a whole request straight to `worker_id`.
    ///
    /// Ignored at build time for workers that are unregistered or can plan
    /// multi-step work themselves.
    pub fn direct_keywords<I, S>(mut self, worker_id: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.direct
            .push((worker_id.into(), keywords.into_iter().map(Into::into).collect()));
        self
    }

    pub fn build(self) -> Result<WorkerSelector> {
        let mut keywords = KeywordMatcher::builder();
        for (worker, words) in self.keywords {
            keywords = keywords.rule(worker, words);
        }

        let mut direct = KeywordMatcher::builder();
        for (worker, words) in self.direct {
            match self.registry.get(&worker) {
                Ok(profile) if !profile.can_multi_step_plan => direct = direct.rule(worker, words),
                Ok(_) => tracing::debug!(worker = %worker, "multi-step worker, direct keywords ignored"),
                Err(_) => tracing::warn!(worker = %worker, "direct keywords for unregistered worker"),
            }
        }

        Ok(WorkerSelector {
            registry: self.registry,
            orchestrator: self.orchestrator,
            keywords: keywords.build()?,
            direct: direct.build()?,
            tag: Regex::new(r"^\s*\[(\w+)\]\s*(.+)$")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use conductor_kernel::{Worker, WorkerProfile, WorkerRequest};

    use super::*;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn handle(&self, request: &WorkerRequest) -> conductor_kernel::Result<String> {
            Ok(request.content.clone())
        }
    }

    fn registry() -> WorkerRegistry {
        let registry = WorkerRegistry::new();
        registry.register(
            WorkerProfile::new("zAI", "zAI Orchestrator").with_multi_step_planning(true),
            Arc::new(Echo),
        );
        registry.register(WorkerProfile::new("HR", "HR Agent").with_hitl(true), Arc::new(Echo));
        registry.register(WorkerProfile::new("FPA", "Financial Process Automation"), Arc::new(Echo));
        registry
    }

    fn selector() -> WorkerSelector {
        WorkerSelector::builder(registry(), "zAI")
            .keywords("HR", ["salary", "employee", "hr", "staff"])
            .keywords("FPA", ["financial", "budget", "report"])
            .direct_keywords("HR", ["salary", "employee"])
            .direct_keywords("zAI", ["plan"])
            .direct_keywords("LEGAL", ["contract"])
            .build()
            .unwrap()
    }

    #[test]
    fn assigned_worker_wins_when_registered() {
        let s = selector();
        let choice = s.select(&PlanStep::assigned("FPA", "Count employees"));
        assert_eq!(choice.worker_id, "FPA");
        assert_eq!(choice.source, SelectionSource::Assigned);

        let choice = s.select(&PlanStep::assigned("LEGAL", "Count employees"));
        assert_eq!(choice.worker_id, "HR");
        assert_eq!(choice.source, SelectionSource::Keyword);
    }

    #[test]
    fn tag_is_stripped() {
        let choice = selector().select(&PlanStep::new("[FPA] Summarize Q3"));
        assert_eq!(choice.worker_id, "FPA");
        assert_eq!(choice.task_text, "Summarize Q3");
        assert_eq!(choice.source, SelectionSource::Tagged);
    }

    #[test]
    fn unmatched_steps_go_to_orchestrator() {
        let choice = selector().select(&PlanStep::new("Write a haiku about three cats"));
        assert_eq!(choice.worker_id, "zAI");
        assert_eq!(choice.source, SelectionSource::Default);
    }

    #[test]
    fn direct_target_only_for_single_purpose_workers() {
        let s = selector();
        assert_eq!(s.direct_target("Show salary for employee 42").as_deref(), Some("HR"));
        assert!(s.direct_target("plan the offsite").is_none());
        assert!(s.direct_target("review this contract").is_none());
        assert!(s.direct_target("What is 2+2?").is_none());
    }

    #[test]
    fn approval_policy_flags_destructive_steps() {
        let policy = ApprovalPolicy::with_default_keywords().unwrap();
        let state = WorkflowState::new("q");
        let req = policy.check(&state, 0, "Delete inactive records").unwrap();
        assert_eq!(req.reason, ApprovalReason::DbChange);
        assert_eq!(req.step_text, "Delete inactive records");
        assert!(policy.check(&state, 0, "List inactive records").is_none());
        assert!(policy.is_destructive("Recreate the payroll table"));
        assert!(policy.is_destructive("Upsert rows via reinsert"));
        assert!(!policy.is_destructive("Summarize the payroll table"));
    }

    #[test]
    fn approved_steps_skip_the_policy() {
        let policy = ApprovalPolicy::with_default_keywords().unwrap();
        let mut state = WorkflowState::new("q");
        state.approved_steps.insert(1);
        assert!(policy.check(&state, 1, "Drop the staging table").is_none());
        assert!(policy.check(&state, 2, "Drop the staging table").is_some());
    }
}

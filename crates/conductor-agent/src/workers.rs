//! Oracle-backed workers.
//!
//! The reference deployment has no real HR or finance backends; each worker
//! answers in its role by asking the oracle.  A worker with domain keywords
//! declines requests outside its domain without calling the oracle.

use std::sync::Arc;

use async_trait::async_trait;
use conductor_kernel::{KernelError, KeywordMatcher, Worker, WorkerProfile, WorkerRegistry, WorkerRequest};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::llm::Oracle;

pub struct OracleWorker {
    profile: WorkerProfile,
    oracle: Arc<dyn Oracle>,
    domain: KeywordMatcher,
}

impl OracleWorker {
    pub fn new(profile: WorkerProfile, oracle: Arc<dyn Oracle>) -> Self {
        Self {
            profile,
            oracle,
            domain: KeywordMatcher::empty(),
        }
    }

    /// Decline requests that mention none of `keywords`.
    pub fn with_domain_keywords<I, S>(mut self, keywords: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domain = KeywordMatcher::for_target(self.profile.id.clone(), keywords)?;
        Ok(self)
    }

    pub fn profile(&self) -> &WorkerProfile {
        &self.profile
    }

    fn in_domain(&self, text: &str) -> bool {
        self.domain.is_empty() || self.domain.is_match(text)
    }

    fn refusal(&self) -> String {
        format!(
            "I'm the {}. I can only help with {}. Please route this request to a more suitable worker.",
            self.profile.name,
            self.profile.capabilities.join(", ").replace('_', " ")
        )
    }

    fn build_prompt(&self, request: &WorkerRequest) -> String {
        format!(
            "You are the {name}. {description}\n\
             Your capabilities: {caps}.\n\n\
             Task from {from}: {task}\n\n\
             Answer the task directly and concisely.",
            name = self.profile.name,
            description = self.profile.description,
            caps = self.profile.capabilities.join(", "),
            from = request.from,
            task = request.content,
        )
    }
}

#[async_trait]
impl Worker for OracleWorker {
    async fn handle(&self, request: &WorkerRequest) -> conductor_kernel::Result<String> {
        if !self.in_domain(&request.content) {
            tracing::info!(worker = %self.profile.id, "request outside worker domain, declining");
            return Ok(self.refusal());
        }
        self.oracle
            .complete(&self.build_prompt(request))
            .await
            .map(|answer| answer.trim().to_owned())
            .map_err(|e| KernelError::WorkerFailed {
                worker_id: self.profile.id.clone(),
                reason: e.to_string(),
            })
    }
}

/// Register an [`OracleWorker`] for every configured worker.
pub fn register_oracle_workers(
    registry: &WorkerRegistry,
    workers: &[WorkerConfig],
    oracle: &Arc<dyn Oracle>,
) -> Result<()> {
    for config in workers {
        let worker = OracleWorker::new(config.profile(), Arc::clone(oracle))
            .with_domain_keywords(config.domain_keywords.iter().cloned())?;
        registry.register(config.profile(), Arc::new(worker));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedOracle;

    fn fpa(oracle: Arc<ScriptedOracle>) -> OracleWorker {
        OracleWorker::new(
            WorkerProfile::new("FPA", "Financial Process Automation")
                .with_capabilities(["revenue_analysis", "burn_rate"]),
            oracle,
        )
        .with_domain_keywords(["revenue", "budget", "burn"])
        .unwrap()
    }

    fn request(content: &str) -> WorkerRequest {
        WorkerRequest {
            task_id: None,
            from: "zAI".into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn in_domain_request_reaches_oracle() {
        let oracle = Arc::new(ScriptedOracle::new().otherwise("  Revenue was $4M. "));
        let worker = fpa(oracle.clone());
        let answer = worker.handle(&request("What was Q3 revenue?")).await.unwrap();

        assert_eq!(answer, "Revenue was $4M.");
        let prompt = &oracle.prompts()[0];
        assert!(prompt.contains("You are the Financial Process Automation"));
        assert!(prompt.contains("Task from zAI: What was Q3 revenue?"));
    }

    #[tokio::test]
    async fn out_of_domain_request_is_declined_without_oracle() {
        let oracle = Arc::new(ScriptedOracle::new().otherwise("unused"));
        let worker = fpa(oracle.clone());
        let answer = worker.handle(&request("Write a poem about cats")).await.unwrap();

        assert!(answer.starts_with("I'm the Financial Process Automation"));
        assert!(answer.contains("revenue analysis, burn rate"));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn without_domain_everything_is_accepted() {
        let oracle = Arc::new(ScriptedOracle::new().otherwise("sure"));
        let worker = OracleWorker::new(WorkerProfile::new("zAI", "zAI Orchestrator"), oracle);
        assert_eq!(worker.handle(&request("anything")).await.unwrap(), "sure");
    }

    #[tokio::test]
    async fn oracle_failure_becomes_worker_failure() {
        let worker = fpa(Arc::new(ScriptedOracle::new()));
        let err = worker.handle(&request("budget for 2025")).await.unwrap_err();
        assert!(matches!(err, KernelError::WorkerFailed { ref worker_id, .. } if worker_id == "FPA"));
    }

    #[tokio::test]
    async fn registers_every_configured_worker() {
        let config = crate::config::EngineConfig::builtin().unwrap();
        let registry = WorkerRegistry::new();
        let oracle: Arc<dyn Oracle> = Arc::new(ScriptedOracle::new().otherwise("ok"));
        register_oracle_workers(&registry, &config.workers, &oracle).unwrap();

        assert_eq!(registry.count(), 3);
        assert!(registry.get("HR").unwrap().hitl_enabled);
    }
}

//! Worker registry.
//!
//! The registry holds the static description of every worker the engine can
//! delegate to ([`WorkerProfile`]) together with the endpoint used to reach it
//! (a [`Worker`] handler).  Profiles are read-only once registered and shared
//! between all workflow instances.
//!
//! Internally the registry is backed by [`DashMap`], so lookups from many
//! concurrent instances never contend on a global lock.
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use conductor_kernel::registry::{Worker, WorkerProfile, WorkerRegistry, WorkerRequest};
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Worker for Echo {
//!     async fn handle(&self, request: &WorkerRequest) -> conductor_kernel::Result<String> {
//!         Ok(request.content.clone())
//!     }
//! }
//!
//! let registry = WorkerRegistry::new();
//! registry.register(WorkerProfile::new("echo", "Echo Worker"), Arc::new(Echo));
//! assert_eq!(registry.get("echo").unwrap().name, "Echo Worker");
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Static description of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProfile {
    /// Unique identifier (e.g. "HR", "FPA").
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// What the worker is for; shown to the planner.
    pub description: String,
    /// Capability tags, shown to the planner.
    pub capabilities: Vec<String>,
    /// Whether the worker can decompose a request into several steps itself.
    pub can_multi_step_plan: bool,
    /// Whether steps delegated to this worker pass through approval gating.
    pub hitl_enabled: bool,
}

impl WorkerProfile {
    /// Create a profile with no capabilities and all flags off.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
            can_multi_step_plan: false,
            hitl_enabled: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_multi_step_planning(mut self, enabled: bool) -> Self {
        self.can_multi_step_plan = enabled;
        self
    }

    pub fn with_hitl(mut self, enabled: bool) -> Self {
        self.hitl_enabled = enabled;
        self
    }
}

/// A unit of work handed to a worker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// The task this request belongs to, if any.
    pub task_id: Option<String>,
    /// Sender id (usually the orchestrating worker).
    pub from: String,
    /// The task text.
    pub content: String,
}

/// A worker endpoint.
///
/// Implementations may fail; the message bus turns failures into response
/// text so a delegation never aborts the workflow.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn handle(&self, request: &WorkerRequest) -> Result<String>;
}

struct RegisteredWorker {
    profile: WorkerProfile,
    handler: Arc<dyn Worker>,
    seq: u64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent worker registry backed by [`DashMap`].
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<DashMap<String, RegisteredWorker>>,
    next_seq: Arc<AtomicU64>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a worker.
    ///
    /// If a worker with the same id already exists it is replaced, keeping its
    /// original listing position.
    pub fn register(&self, profile: WorkerProfile, handler: Arc<dyn Worker>) {
        let id = profile.id.clone();
        let seq = self
            .inner
            .get(&id)
            .map(|existing| existing.seq)
            .unwrap_or_else(|| self.next_seq.fetch_add(1, Ordering::Relaxed));

        tracing::info!(worker_id = %id, name = %profile.name, "worker registered");

        self.inner.insert(
            id,
            RegisteredWorker {
                profile,
                handler,
                seq,
            },
        );
    }

    /// Look up a worker profile.
    pub fn get(&self, id: &str) -> Result<WorkerProfile> {
        self.inner
            .get(id)
            .map(|entry| entry.profile.clone())
            .ok_or_else(|| KernelError::WorkerNotFound {
                worker_id: id.to_string(),
            })
    }

    /// Look up the endpoint of a worker.
    pub fn handler(&self, id: &str) -> Result<Arc<dyn Worker>> {
        self.inner
            .get(id)
            .map(|entry| Arc::clone(&entry.handler))
            .ok_or_else(|| KernelError::WorkerNotFound {
                worker_id: id.to_string(),
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    /// All profiles in registration order.
    pub fn list_all(&self) -> Vec<WorkerProfile> {
        let mut entries: Vec<(u64, WorkerProfile)> = self
            .inner
            .iter()
            .map(|e| (e.seq, e.profile.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, profile)| profile).collect()
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl Worker for Fixed {
        async fn handle(&self, _request: &WorkerRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn hr_profile() -> WorkerProfile {
        WorkerProfile::new("HR", "HR Agent")
            .with_description("Employee data")
            .with_capabilities(["employee_data", "salary_info"])
            .with_hitl(true)
    }

    #[test]
    fn register_and_retrieve() {
        let registry = WorkerRegistry::new();
        registry.register(hr_profile(), Arc::new(Fixed("ok")));

        let profile = registry.get("HR").expect("worker should exist");
        assert_eq!(profile.name, "HR Agent");
        assert!(profile.hitl_enabled);
        assert!(!profile.can_multi_step_plan);
        assert!(registry.contains("HR"));
    }

    #[test]
    fn unknown_worker_is_not_found() {
        let registry = WorkerRegistry::new();
        let err = registry.get("UNKNOWN").unwrap_err();
        assert!(matches!(err, KernelError::WorkerNotFound { .. }));
        assert!(registry.handler("UNKNOWN").is_err());
    }

    #[test]
    fn list_preserves_registration_order() {
        let registry = WorkerRegistry::new();
        registry.register(WorkerProfile::new("zAI", "Orchestrator"), Arc::new(Fixed("a")));
        registry.register(hr_profile(), Arc::new(Fixed("b")));
        registry.register(WorkerProfile::new("FPA", "Finance"), Arc::new(Fixed("c")));

        let ids = |r: &WorkerRegistry| r.list_all().into_iter().map(|p| p.id).collect::<Vec<_>>();
        assert_eq!(ids(&registry), vec!["zAI", "HR", "FPA"]);

        // Re-registering keeps the slot.
        registry.register(WorkerProfile::new("zAI", "Renamed"), Arc::new(Fixed("d")));
        assert_eq!(ids(&registry), vec!["zAI", "HR", "FPA"]);
        assert_eq!(registry.count(), 3);
        assert_eq!(registry.get("zAI").unwrap().name, "Renamed");
    }

    #[tokio::test]
    async fn handler_is_callable() {
        let registry = WorkerRegistry::new();
        registry.register(hr_profile(), Arc::new(Fixed("42 employees")));

        let handler = registry.handler("HR").unwrap();
        let request = WorkerRequest {
            task_id: None,
            from: "zAI".into(),
            content: "count employees".into(),
        };
        assert_eq!(handler.handle(&request).await.unwrap(), "42 employees");
    }
}

//! Worker message bus.
//!
//! The bus delivers a delegation message to the addressed worker, waits for
//! its answer and hands the answer back as plain text.  Delivery never fails
//! from the caller's point of view: an unknown worker, a failing handler or a
//! timeout all produce an `Error: ...` response string, which the
//! coordinator records like any other answer.
//!
//! Every sent message and every response is appended to a bounded history and
//! broadcast to live subscribers over [`tokio::sync::broadcast`].  Subscribers
//! receive [`Arc<AgentMessage>`] so fan-out does not clone payloads.
//!
//! ```rust,no_run
//! # use conductor_kernel::{AgentMessage, MessageBus, MessageKind, WorkerRegistry};
//! # async fn example() {
//! let bus = MessageBus::new(WorkerRegistry::new());
//! let reply = bus
//!     .send(AgentMessage::new("zAI", "UNKNOWN", "hello", MessageKind::Delegation))
//!     .await;
//! assert!(reply.contains("not found"));
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::KernelError;
use crate::registry::{WorkerRegistry, WorkerRequest};

/// Prefix carried by every response the bus synthesizes on failure.
pub const ERROR_PREFIX: &str = "Error:";

/// Returns `true` when a response text reports a delivery or worker failure.
pub fn is_error_response(text: &str) -> bool {
    text.trim_start().starts_with(ERROR_PREFIX)
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Delegation,
    Response,
    Coordination,
}

/// One message exchanged between workers.  Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: String,
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

impl AgentMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            from: from.into(),
            to: to.into(),
            content: content.into(),
            task_id: None,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// A delivered message together with the worker's answer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub request: AgentMessage,
    pub response: AgentMessage,
}

impl Delivery {
    pub fn response_text(&self) -> &str {
        &self.response.content
    }

    pub fn is_error(&self) -> bool {
        is_error_response(&self.response.content)
    }
}

// ---------------------------------------------------------------------------
// Bus configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum number of messages kept in history; oldest are dropped first.
    pub history_capacity: usize,
    /// Broadcast channel capacity for live subscribers.
    pub broadcast_capacity: usize,
    /// Upper bound on a single worker call.  `None` waits indefinitely.
    pub worker_timeout: Option<Duration>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1024,
            broadcast_capacity: 256,
            worker_timeout: Some(Duration::from_secs(120)),
        }
    }
}

// ---------------------------------------------------------------------------
// Message bus
// ---------------------------------------------------------------------------

/// Delivers messages to registered workers.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    registry: WorkerRegistry,
    config: BusConfig,
    history: Mutex<VecDeque<AgentMessage>>,
    sender: broadcast::Sender<Arc<AgentMessage>>,
}

impl MessageBus {
    /// Create a bus with the default [`BusConfig`].
    #[must_use]
    pub fn new(registry: WorkerRegistry) -> Self {
        Self::with_config(registry, BusConfig::default())
    }

    #[must_use]
    pub fn with_config(registry: WorkerRegistry, config: BusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                registry,
                history: Mutex::new(VecDeque::with_capacity(config.history_capacity.min(1024))),
                config,
                sender,
            }),
        }
    }

    /// The registry this bus resolves workers against.
    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    /// Deliver `message` and return the worker's answer text.
    pub async fn send(&self, message: AgentMessage) -> String {
        self.dispatch(message).await.response.content
    }

    /// Deliver `message` and return both the sent message and the response.
    pub async fn dispatch(&self, message: AgentMessage) -> Delivery {
        self.record(message.clone());

        let content = self.call_worker(&message).await;

        let mut response =
            AgentMessage::new(message.to.clone(), message.from.clone(), content, MessageKind::Response);
        response.task_id = message.task_id.clone();
        self.record(response.clone());

        Delivery {
            request: message,
            response,
        }
    }

    /// Snapshot of the full message history, oldest first.
    pub fn history(&self) -> Vec<AgentMessage> {
        self.lock_history().iter().cloned().collect()
    }

    /// Messages sent by or addressed to `worker_id`, oldest first.
    pub fn history_for(&self, worker_id: &str) -> Vec<AgentMessage> {
        self.lock_history()
            .iter()
            .filter(|m| m.from == worker_id || m.to == worker_id)
            .cloned()
            .collect()
    }

    /// Subscribe to every future message.  Past messages are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentMessage>> {
        self.inner.sender.subscribe()
    }

    // -- Private helpers ----------------------------------------------------

    async fn call_worker(&self, message: &AgentMessage) -> String {
        let to = &message.to;
        let handler = match self.inner.registry.handler(to) {
            Ok(handler) => handler,
            Err(_) => {
                tracing::warn!(worker_id = %to, "delegation to unknown worker");
                return format!("{ERROR_PREFIX} worker {to} not found");
            }
        };

        let request = WorkerRequest {
            task_id: message.task_id.clone(),
            from: message.from.clone(),
            content: message.content.clone(),
        };

        let outcome = match self.inner.config.worker_timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.handle(&request)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(worker_id = %to, timeout_secs = limit.as_secs(), "worker timed out");
                    return format!(
                        "{ERROR_PREFIX} worker {to} timed out after {}s",
                        limit.as_secs()
                    );
                }
            },
            None => handler.handle(&request).await,
        };

        match outcome {
            Ok(text) => {
                tracing::debug!(worker_id = %to, chars = text.len(), "worker answered");
                text
            }
            Err(e) => {
                let reason = match e {
                    KernelError::WorkerFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                tracing::warn!(worker_id = %to, reason = %reason, "worker failed");
                format!("{ERROR_PREFIX} worker {to} failed: {reason}")
            }
        }
    }

    fn record(&self, message: AgentMessage) {
        let message = Arc::new(message);
        {
            let mut history = self.lock_history();
            history.push_back(message.as_ref().clone());
            while history.len() > self.inner.config.history_capacity {
                history.pop_front();
            }
        }
        // No receivers is the common case.
        let _ = self.inner.sender.send(message);
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<AgentMessage>> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::Result;
    use crate::registry::{Worker, WorkerProfile};

    struct Upper;

    #[async_trait]
    impl Worker for Upper {
        async fn handle(&self, request: &WorkerRequest) -> Result<String> {
            Ok(request.content.to_uppercase())
        }
    }

    struct Broken;

    #[async_trait]
    impl Worker for Broken {
        async fn handle(&self, _request: &WorkerRequest) -> Result<String> {
            Err(KernelError::WorkerFailed {
                worker_id: "FPA".into(),
                reason: "ledger offline".into(),
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl Worker for Slow {
        async fn handle(&self, _request: &WorkerRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    fn bus_with(workers: Vec<(&str, Arc<dyn Worker>)>, config: BusConfig) -> MessageBus {
        let registry = WorkerRegistry::new();
        for (id, handler) in workers {
            registry.register(WorkerProfile::new(id, id), handler);
        }
        MessageBus::with_config(registry, config)
    }

    #[tokio::test]
    async fn send_returns_worker_answer() {
        let bus = bus_with(vec![("HR", Arc::new(Upper))], BusConfig::default());
        let reply = bus
            .send(AgentMessage::new("zAI", "HR", "count staff", MessageKind::Delegation))
            .await;
        assert_eq!(reply, "COUNT STAFF");
    }

    #[tokio::test]
    async fn unknown_worker_yields_not_found_text() {
        let bus = bus_with(vec![], BusConfig::default());
        let delivery = bus
            .dispatch(AgentMessage::new("zAI", "UNKNOWN", "hi", MessageKind::Delegation))
            .await;
        assert!(delivery.response_text().contains("not found"));
        assert!(delivery.is_error());
        // Both the request and the synthesized response are recorded.
        assert_eq!(bus.history().len(), 2);
    }

    #[tokio::test]
    async fn worker_failure_becomes_text() {
        let bus = bus_with(vec![("FPA", Arc::new(Broken))], BusConfig::default());
        let reply = bus
            .send(AgentMessage::new("zAI", "FPA", "close books", MessageKind::Delegation))
            .await;
        assert_eq!(reply, "Error: worker FPA failed: ledger offline");
    }

    #[tokio::test]
    async fn worker_timeout_becomes_text() {
        let config = BusConfig {
            worker_timeout: Some(Duration::from_millis(20)),
            ..BusConfig::default()
        };
        let bus = bus_with(vec![("HR", Arc::new(Slow))], config);
        let reply = bus
            .send(AgentMessage::new("zAI", "HR", "wait", MessageKind::Delegation))
            .await;
        assert!(is_error_response(&reply));
        assert!(reply.contains("timed out"));
    }

    #[tokio::test]
    async fn response_carries_task_id_and_swaps_parties() {
        let bus = bus_with(vec![("HR", Arc::new(Upper))], BusConfig::default());
        let delivery = bus
            .dispatch(
                AgentMessage::new("zAI", "HR", "x", MessageKind::Delegation).with_task_id("t1"),
            )
            .await;
        assert_eq!(delivery.response.kind, MessageKind::Response);
        assert_eq!(delivery.response.from, "HR");
        assert_eq!(delivery.response.to, "zAI");
        assert_eq!(delivery.response.task_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn history_is_bounded_and_filterable() {
        let config = BusConfig {
            history_capacity: 3,
            ..BusConfig::default()
        };
        let bus = bus_with(vec![("HR", Arc::new(Upper)), ("FPA", Arc::new(Upper))], config);

        bus.send(AgentMessage::new("zAI", "HR", "one", MessageKind::Delegation))
            .await;
        bus.send(AgentMessage::new("zAI", "FPA", "two", MessageKind::Delegation))
            .await;

        let history = bus.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "ONE");
        assert_eq!(bus.history_for("FPA").len(), 2);
    }

    #[tokio::test]
    async fn subscribers_observe_both_directions() {
        let bus = bus_with(vec![("HR", Arc::new(Upper))], BusConfig::default());
        let mut rx = bus.subscribe();

        bus.send(AgentMessage::new("zAI", "HR", "ping", MessageKind::Delegation))
            .await;

        let first = rx.recv().await.expect("delegation event");
        let second = rx.recv().await.expect("response event");
        assert_eq!(first.kind, MessageKind::Delegation);
        assert_eq!(second.kind, MessageKind::Response);
        assert_eq!(second.content, "PING");
    }
}

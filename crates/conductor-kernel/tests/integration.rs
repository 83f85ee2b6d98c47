//! Integration tests for the conductor-kernel crate.
//!
//! These exercise the registry, message bus and keyword matcher together the
//! way the workflow engine uses them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use conductor_kernel::{
    AgentMessage, KernelError, KeywordMatcher, MessageBus, MessageKind, Worker, WorkerProfile,
    WorkerRegistry, WorkerRequest,
};

struct Counting {
    calls: AtomicUsize,
    prefix: &'static str,
}

#[async_trait]
impl Worker for Counting {
    async fn handle(&self, request: &WorkerRequest) -> conductor_kernel::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}: {}", self.prefix, request.content))
    }
}

fn counting(prefix: &'static str) -> Arc<Counting> {
    Arc::new(Counting {
        calls: AtomicUsize::new(0),
        prefix,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry + bus
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn delegation_reaches_registered_worker_only() {
    let registry = WorkerRegistry::new();
    let hr = counting("HR");
    let fpa = counting("FPA");
    registry.register(WorkerProfile::new("HR", "HR Agent"), hr.clone());
    registry.register(WorkerProfile::new("FPA", "Finance"), fpa.clone());

    let bus = MessageBus::new(registry);
    let reply = bus
        .send(AgentMessage::new("zAI", "HR", "list staff", MessageKind::Delegation).with_task_id("t1"))
        .await;

    assert_eq!(reply, "HR: list staff");
    assert_eq!(hr.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fpa.calls.load(Ordering::SeqCst), 0);

    let history = bus.history_for("HR");
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|m| m.task_id.as_deref() == Some("t1")));
}

#[tokio::test]
async fn send_to_unknown_worker_reports_not_found() {
    let bus = MessageBus::new(WorkerRegistry::new());
    let reply = bus
        .send(AgentMessage::new("zAI", "UNKNOWN", "anything", MessageKind::Delegation))
        .await;
    assert!(reply.contains("not found"), "got: {reply}");
}

#[tokio::test]
async fn registry_changes_are_visible_through_the_bus() {
    let registry = WorkerRegistry::new();
    let bus = MessageBus::new(registry.clone());

    let before = bus
        .send(AgentMessage::new("zAI", "HR", "x", MessageKind::Delegation))
        .await;
    assert!(before.contains("not found"));

    registry.register(WorkerProfile::new("HR", "HR Agent"), counting("HR"));
    let after = bus
        .send(AgentMessage::new("zAI", "HR", "x", MessageKind::Delegation))
        .await;
    assert_eq!(after, "HR: x");

    assert!(matches!(
        bus.registry().get("FPA"),
        Err(KernelError::WorkerNotFound { .. })
    ));
}

#[tokio::test]
async fn concurrent_delegations_all_recorded() {
    let registry = WorkerRegistry::new();
    let hr = counting("HR");
    registry.register(WorkerProfile::new("HR", "HR Agent"), hr.clone());
    let bus = MessageBus::new(registry);

    let mut handles = Vec::new();
    for i in 0..10 {
        let bus = bus.clone();
        handles.push(tokio::spawn(async move {
            bus.send(AgentMessage::new("zAI", "HR", format!("q{i}"), MessageKind::Delegation))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    assert_eq!(hr.calls.load(Ordering::SeqCst), 10);
    assert_eq!(bus.history().len(), 20);
}

// ═══════════════════════════════════════════════════════════════════════
//  Keyword routing against the registry
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn keyword_targets_resolve_to_registered_workers() {
    let registry = WorkerRegistry::new();
    registry.register(WorkerProfile::new("HR", "HR Agent"), counting("HR"));
    registry.register(WorkerProfile::new("FPA", "Finance"), counting("FPA"));

    let matcher = KeywordMatcher::builder()
        .rule("HR", ["salary", "employee", "hiring"])
        .rule("FPA", ["budget", "expense"])
        .build()
        .expect("build");

    for (text, expected) in [
        ("Summarize hiring plans", "HR"),
        ("Expense breakdown for March", "FPA"),
        ("Salary budget", "HR"),
    ] {
        let hit = matcher.find(text).expect("keyword hit");
        assert_eq!(hit.target, expected, "text: {text}");
        assert!(registry.contains(&hit.target));
    }
}

//! Integration tests for the conductor-store crate.
//!
//! These run against a real SQLite file on disk (via tempfile) and check that
//! tasks, checkpoints and sessions survive reopening the database.

use std::sync::Arc;

use conductor_store::{
    CheckpointRecord, CheckpointStore, Database, SessionStore, SqliteCheckpointStore,
    SqliteTaskStore, Task, TaskStatus, TaskStore,
};
use serde_json::json;

// ═══════════════════════════════════════════════════════════════════════
//  Database lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn open_and_migrate_is_idempotent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("conductor.db");

    Database::open_and_migrate(path.clone()).await.unwrap();
    let db = Database::open_and_migrate(path.clone()).await.unwrap();

    let version = db
        .execute(|conn| conn_version(conn))
        .await
        .unwrap();
    assert_eq!(version, conductor_store::migration::latest_version());
    assert!(path.exists());
}

fn conn_version(conn: &rusqlite::Connection) -> conductor_store::StoreResult<u32> {
    conductor_store::migration::current_version(conn)
}

// ═══════════════════════════════════════════════════════════════════════
//  Task store
// ═══════════════════════════════════════════════════════════════════════

/// Two puts for the same (worker, id) leave one record with the last result.
#[tokio::test]
async fn task_upsert_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    {
        let store = SqliteTaskStore::new(Database::open_and_migrate(path.clone()).await.unwrap());
        let mut task = Task::new("step_0_HR", "HR", "count staff").with_id("t1");
        store.put("HR", &task).await.unwrap();
        task.complete("42");
        store.put("HR", &task).await.unwrap();
    }

    let store = SqliteTaskStore::new(Database::open_and_migrate(path).await.unwrap());
    let tasks = store.list_by_worker("HR").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].result.as_deref(), Some("42"));
    assert_eq!(tasks[0].status(), TaskStatus::Completed);
}

#[tokio::test]
async fn concurrent_puts_do_not_duplicate() {
    let db = Database::in_memory_migrated().await.unwrap();
    let store = Arc::new(SqliteTaskStore::new(db));

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut task = Task::new("step", "HR", "same id").with_id("shared");
            task.complete(format!("writer {i}"));
            store.put("HR", &task).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let tasks = store.list_by_worker("HR").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].result.as_deref().unwrap().starts_with("writer "));
}

// ═══════════════════════════════════════════════════════════════════════
//  Checkpoints and sessions
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn checkpoints_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");

    {
        let store =
            SqliteCheckpointStore::new(Database::open_and_migrate(path.clone()).await.unwrap());
        store
            .save(&CheckpointRecord::new(
                "instance-1",
                "approval_gate",
                "awaiting_human",
                json!({"plan": ["[HR] Delete inactive records"]}),
            ))
            .await
            .unwrap();
    }

    let store = SqliteCheckpointStore::new(Database::open_and_migrate(path).await.unwrap());
    let all = store.list().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].instance_id, "instance-1");
    assert_eq!(all[0].payload["plan"][0], "[HR] Delete inactive records");
}

#[tokio::test]
async fn session_state_accumulates() {
    let db = Database::in_memory_migrated().await.unwrap();
    let sessions = SessionStore::new(db);

    let id = sessions
        .create_session(json!({"request": "Quarterly review"}))
        .await
        .unwrap();
    for step in 1..=3 {
        sessions
            .update_session_state(&id, json!({"current_step": step, "last_task": format!("task_{step}")}))
            .await
            .unwrap();
    }

    let state = sessions.get(&id).await.unwrap().state;
    assert_eq!(state["current_step"], 3);
    assert_eq!(state["last_task"], "task_3");
    assert_eq!(state.len(), 2);
}

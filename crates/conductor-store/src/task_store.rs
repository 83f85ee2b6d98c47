//! Per-worker task persistence.
//!
//! [`TaskStore`] keeps the [`Task`] records each worker has been handed,
//! keyed by `(worker_id, task_id)`.  `put` is an upsert: writing the same id
//! twice leaves one record holding the last write, in its original position.
//!
//! Two implementations share the trait:
//!
//! - [`MemoryTaskStore`] -- [`DashMap`] of per-worker vectors; process-local.
//! - [`SqliteTaskStore`] -- the `worker_tasks` table; survives restarts.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::db::{Database, from_millis, to_millis};
use crate::error::StoreResult;
use crate::task::Task;

// ═══════════════════════════════════════════════════════════════════════
//  Trait
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace the task with `task.id` under `worker_id`.
    async fn put(&self, worker_id: &str, task: &Task) -> StoreResult<()>;

    /// All tasks of one worker, in first-insertion order.
    async fn list_by_worker(&self, worker_id: &str) -> StoreResult<Vec<Task>>;

    async fn get(&self, worker_id: &str, task_id: &str) -> StoreResult<Option<Task>>;

    /// Remove every task of every worker.
    async fn clear(&self) -> StoreResult<()>;

    /// Remove tasks that started more than `older_than_hours` ago and
    /// return how many were removed.
    async fn expire(&self, older_than_hours: u64) -> StoreResult<usize>;
}

fn cutoff(older_than_hours: u64) -> chrono::DateTime<Utc> {
    let hours = i64::try_from(older_than_hours).unwrap_or(i64::MAX);
    Utc::now()
        .checked_sub_signed(Duration::try_hours(hours).unwrap_or(Duration::MAX))
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
}

// ═══════════════════════════════════════════════════════════════════════
//  In-memory
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: DashMap<String, Vec<Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put(&self, worker_id: &str, task: &Task) -> StoreResult<()> {
        let mut entry = self.tasks.entry(worker_id.to_string()).or_default();
        match entry.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => entry.push(task.clone()),
        }
        debug!(worker_id, task_id = %task.id, "task stored");
        Ok(())
    }

    async fn list_by_worker(&self, worker_id: &str) -> StoreResult<Vec<Task>> {
        Ok(self
            .tasks
            .get(worker_id)
            .map(|tasks| tasks.clone())
            .unwrap_or_default())
    }

    async fn get(&self, worker_id: &str, task_id: &str) -> StoreResult<Option<Task>> {
        Ok(self
            .tasks
            .get(worker_id)
            .and_then(|tasks| tasks.iter().find(|t| t.id == task_id).cloned()))
    }

    async fn clear(&self) -> StoreResult<()> {
        self.tasks.clear();
        Ok(())
    }

    async fn expire(&self, older_than_hours: u64) -> StoreResult<usize> {
        let cutoff = cutoff(older_than_hours);
        let mut removed = 0;
        for mut entry in self.tasks.iter_mut() {
            let before = entry.len();
            entry.retain(|t| t.start_time >= cutoff);
            removed += before - entry.len();
        }
        self.tasks.retain(|_, tasks| !tasks.is_empty());
        debug!(removed, older_than_hours, "expired tasks");
        Ok(removed)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SQLite
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct SqliteTaskStore {
    db: Database,
}

impl SqliteTaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

const SELECT_COLUMNS: &str = "id, name, assigned_worker, description, start_time, end_time, \
     result, error, checkpoint, interruptions";

struct TaskRow {
    id: String,
    name: String,
    assigned_worker: String,
    description: String,
    start_time: i64,
    end_time: Option<i64>,
    result: Option<String>,
    error: Option<String>,
    checkpoint: Option<String>,
    interruptions: String,
}

impl TaskRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            assigned_worker: row.get(2)?,
            description: row.get(3)?,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            result: row.get(6)?,
            error: row.get(7)?,
            checkpoint: row.get(8)?,
            interruptions: row.get(9)?,
        })
    }

    fn into_task(self) -> StoreResult<Task> {
        Ok(Task {
            id: self.id,
            name: self.name,
            assigned_worker: self.assigned_worker,
            description: self.description,
            start_time: from_millis("start_time", self.start_time)?,
            end_time: self
                .end_time
                .map(|ms| from_millis("end_time", ms))
                .transpose()?,
            result: self.result,
            error: self.error,
            checkpoint: self
                .checkpoint
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            interruptions: serde_json::from_str(&self.interruptions)?,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn put(&self, worker_id: &str, task: &Task) -> StoreResult<()> {
        let worker_id = worker_id.to_string();
        let task = task.clone();
        let checkpoint = task
            .checkpoint
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let interruptions = serde_json::to_string(&task.interruptions)?;

        // ON CONFLICT ... DO UPDATE keeps the rowid, so list order is stable.
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO worker_tasks \
                     (worker_id, id, name, assigned_worker, description, start_time, end_time, \
                      result, error, checkpoint, interruptions) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(worker_id, id) DO UPDATE SET \
                       name = excluded.name, assigned_worker = excluded.assigned_worker, \
                       description = excluded.description, start_time = excluded.start_time, \
                       end_time = excluded.end_time, result = excluded.result, \
                       error = excluded.error, checkpoint = excluded.checkpoint, \
                       interruptions = excluded.interruptions",
                    rusqlite::params![
                        worker_id,
                        task.id,
                        task.name,
                        task.assigned_worker,
                        task.description,
                        to_millis(task.start_time),
                        task.end_time.map(to_millis),
                        task.result,
                        task.error,
                        checkpoint,
                        interruptions,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn list_by_worker(&self, worker_id: &str) -> StoreResult<Vec<Task>> {
        let worker_id = worker_id.to_string();
        let rows = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM worker_tasks WHERE worker_id = ?1 ORDER BY rowid"
                ))?;
                let rows = stmt
                    .query_map([worker_id], TaskRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    #[instrument(skip(self))]
    async fn get(&self, worker_id: &str, task_id: &str) -> StoreResult<Option<Task>> {
        let worker_id = worker_id.to_string();
        let task_id = task_id.to_string();
        let row = self
            .db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT {SELECT_COLUMNS} FROM worker_tasks WHERE worker_id = ?1 AND id = ?2"
                    ),
                    [worker_id, task_id],
                    TaskRow::read,
                );
                match result {
                    Ok(row) => Ok(Some(row)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> StoreResult<()> {
        let removed = self
            .db
            .execute(|conn| Ok(conn.execute("DELETE FROM worker_tasks", [])?))
            .await?;
        debug!(removed, "task store cleared");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expire(&self, older_than_hours: u64) -> StoreResult<usize> {
        let cutoff = to_millis(cutoff(older_than_hours));
        let removed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute("DELETE FROM worker_tasks WHERE start_time < ?1", [cutoff])?)
            })
            .await?;
        debug!(removed, "expired tasks");
        Ok(removed)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite() -> SqliteTaskStore {
        SqliteTaskStore::new(Database::in_memory_migrated().await.unwrap())
    }

    async fn backends() -> Vec<(&'static str, Box<dyn TaskStore>)> {
        vec![
            ("memory", Box::new(MemoryTaskStore::new())),
            ("sqlite", Box::new(sqlite().await)),
        ]
    }

    #[tokio::test]
    async fn put_is_upsert_by_id() {
        for (name, store) in backends().await {
            let mut task = Task::new("step_0_HR", "HR", "count staff").with_id("t1");
            store.put("HR", &task).await.unwrap();

            task.complete("42");
            store.put("HR", &task).await.unwrap();

            let tasks = store.list_by_worker("HR").await.unwrap();
            assert_eq!(tasks.len(), 1, "{name}");
            assert_eq!(tasks[0].result.as_deref(), Some("42"), "{name}");
        }
    }

    #[tokio::test]
    async fn upsert_preserves_position() {
        for (name, store) in backends().await {
            for id in ["a", "b", "c"] {
                store
                    .put("FPA", &Task::new(id, "FPA", "x").with_id(id))
                    .await
                    .unwrap();
            }
            let mut b = store.get("FPA", "b").await.unwrap().expect("b exists");
            b.complete("done");
            store.put("FPA", &b).await.unwrap();

            let ids: Vec<String> = store
                .list_by_worker("FPA")
                .await
                .unwrap()
                .into_iter()
                .map(|t| t.id)
                .collect();
            assert_eq!(ids, vec!["a", "b", "c"], "{name}");
        }
    }

    #[tokio::test]
    async fn workers_are_isolated() {
        for (name, store) in backends().await {
            store
                .put("HR", &Task::new("n", "HR", "x").with_id("t1"))
                .await
                .unwrap();
            assert!(store.list_by_worker("FPA").await.unwrap().is_empty(), "{name}");
            assert!(store.get("FPA", "t1").await.unwrap().is_none(), "{name}");
        }
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        for (name, store) in backends().await {
            store.put("HR", &Task::new("n", "HR", "x")).await.unwrap();
            store.put("FPA", &Task::new("n", "FPA", "x")).await.unwrap();
            store.clear().await.unwrap();
            assert!(store.list_by_worker("HR").await.unwrap().is_empty(), "{name}");
            assert!(store.list_by_worker("FPA").await.unwrap().is_empty(), "{name}");
        }
    }

    #[tokio::test]
    async fn expire_drops_only_old_tasks() {
        for (name, store) in backends().await {
            let old = Task::new("old", "HR", "x")
                .with_id("old")
                .with_start_time(Utc::now() - Duration::hours(30));
            let fresh = Task::new("fresh", "HR", "x").with_id("fresh");
            store.put("HR", &old).await.unwrap();
            store.put("HR", &fresh).await.unwrap();

            let removed = store.expire(24).await.unwrap();
            assert_eq!(removed, 1, "{name}");

            let left = store.list_by_worker("HR").await.unwrap();
            assert_eq!(left.len(), 1, "{name}");
            assert_eq!(left[0].id, "fresh", "{name}");
        }
    }

    #[tokio::test]
    async fn sqlite_round_trips_optional_fields() {
        let store = sqlite().await;
        let mut task = Task::new("step_1_FPA", "FPA", "burn rate").with_id("t9");
        task.checkpoint = Some(serde_json::json!({"completed": true}));
        task.interrupt("approval");
        task.fail("ledger offline");
        store.put("FPA", &task).await.unwrap();

        let loaded = store.get("FPA", "t9").await.unwrap().expect("stored");
        assert_eq!(loaded.checkpoint, task.checkpoint);
        assert_eq!(loaded.interruptions, vec!["approval"]);
        assert_eq!(loaded.error.as_deref(), Some("ledger offline"));
        assert_eq!(
            loaded.end_time.map(|t| t.timestamp_millis()),
            task.end_time.map(|t| t.timestamp_millis())
        );
    }
}

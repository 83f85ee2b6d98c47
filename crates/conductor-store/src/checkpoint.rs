//! Durable checkpoints for paused workflow instances.
//!
//! A checkpoint is written whenever an instance stops before reaching a
//! terminal stage (waiting for a human, or a failed stage) and deleted when
//! the instance completes or is cancelled.  The payload is opaque JSON owned
//! by the engine; this module only indexes it by instance id, stage and
//! status.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::HotCache;
use crate::db::{Database, from_millis, to_millis};
use crate::error::StoreResult;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub instance_id: String,
    /// Stage the instance resumes at.
    pub stage: String,
    /// Why the instance is paused (e.g. "awaiting_human", "failed").
    pub status: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(
        instance_id: impl Into<String>,
        stage: impl Into<String>,
        status: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            stage: stage.into(),
            status: status.into(),
            payload,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint of `record.instance_id`.
    ///
    /// On replace the original `created_at` is kept.
    async fn save(&self, record: &CheckpointRecord) -> StoreResult<()>;

    async fn load(&self, instance_id: &str) -> StoreResult<Option<CheckpointRecord>>;

    /// Returns `true` if a checkpoint was removed.
    async fn delete(&self, instance_id: &str) -> StoreResult<bool>;

    /// Every stored checkpoint, oldest first.
    async fn list(&self) -> StoreResult<Vec<CheckpointRecord>>;
}

// ═══════════════════════════════════════════════════════════════════════
//  In-memory
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: DashMap<String, CheckpointRecord>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> StoreResult<()> {
        let mut record = record.clone();
        if let Some(existing) = self.records.get(&record.instance_id) {
            record.created_at = existing.created_at;
        }
        self.records.insert(record.instance_id.clone(), record);
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> StoreResult<Option<CheckpointRecord>> {
        Ok(self.records.get(instance_id).map(|r| r.clone()))
    }

    async fn delete(&self, instance_id: &str) -> StoreResult<bool> {
        Ok(self.records.remove(instance_id).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<CheckpointRecord>> {
        let mut all: Vec<CheckpointRecord> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SQLite (+ hot cache)
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: Database,
    cache: HotCache<CheckpointRecord>,
}

impl SqliteCheckpointStore {
    pub fn new(db: Database) -> Self {
        Self::with_cache_capacity(db, 1_000)
    }

    pub fn with_cache_capacity(db: Database, capacity: u64) -> Self {
        Self {
            db,
            cache: HotCache::new("checkpoints", capacity, Duration::from_secs(600)),
        }
    }

    pub fn cache(&self) -> &HotCache<CheckpointRecord> {
        &self.cache
    }

    async fn load_uncached(&self, instance_id: String) -> StoreResult<Option<CheckpointRecord>> {
        let row = self
            .db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT instance_id, stage, status, payload, created_at, updated_at \
                     FROM checkpoints WHERE instance_id = ?1",
                    [instance_id],
                    read_row,
                );
                match result {
                    Ok(row) => Ok(Some(row)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        row.map(into_record).transpose()
    }
}

type CheckpointRow = (String, String, String, String, i64, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(
    (instance_id, stage, status, payload, created_at, updated_at): CheckpointRow,
) -> StoreResult<CheckpointRecord> {
    Ok(CheckpointRecord {
        instance_id,
        stage,
        status,
        payload: serde_json::from_str(&payload)?,
        created_at: from_millis("created_at", created_at)?,
        updated_at: from_millis("updated_at", updated_at)?,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    #[instrument(skip(self, record), fields(instance_id = %record.instance_id, stage = %record.stage))]
    async fn save(&self, record: &CheckpointRecord) -> StoreResult<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let r = record.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO checkpoints \
                     (instance_id, stage, status, payload, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(instance_id) DO UPDATE SET \
                       stage = excluded.stage, status = excluded.status, \
                       payload = excluded.payload, updated_at = excluded.updated_at",
                    rusqlite::params![
                        r.instance_id,
                        r.stage,
                        r.status,
                        payload,
                        to_millis(r.created_at),
                        to_millis(r.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await?;

        // The stored created_at may differ from the record's; reload lazily.
        self.cache.invalidate(&record.instance_id).await;
        debug!("checkpoint saved");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(&self, instance_id: &str) -> StoreResult<Option<CheckpointRecord>> {
        let key = instance_id.to_string();
        self.cache
            .get_or_load(instance_id, || self.load_uncached(key))
            .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, instance_id: &str) -> StoreResult<bool> {
        let id = instance_id.to_string();
        let removed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute("DELETE FROM checkpoints WHERE instance_id = ?1", [id])?)
            })
            .await?;
        self.cache.invalidate(instance_id).await;
        Ok(removed > 0)
    }

    #[instrument(skip(self))]
    async fn list(&self) -> StoreResult<Vec<CheckpointRecord>> {
        let rows = self
            .db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT instance_id, stage, status, payload, created_at, updated_at \
                     FROM checkpoints ORDER BY created_at, instance_id",
                )?;
                let rows = stmt
                    .query_map([], read_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(into_record).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    async fn backends() -> Vec<(&'static str, Box<dyn CheckpointStore>)> {
        let db = Database::in_memory_migrated().await.unwrap();
        vec![
            ("memory", Box::new(MemoryCheckpointStore::new())),
            ("sqlite", Box::new(SqliteCheckpointStore::new(db))),
        ]
    }

    fn record(id: &str, stage: &str) -> CheckpointRecord {
        CheckpointRecord::new(
            id,
            stage,
            "awaiting_human",
            serde_json::json!({"current_step": 1}),
        )
    }

    #[tokio::test]
    async fn save_then_load() {
        for (name, store) in backends().await {
            store.save(&record("i1", "approval_gate")).await.unwrap();
            let loaded = store.load("i1").await.unwrap().expect(name);
            assert_eq!(loaded.stage, "approval_gate", "{name}");
            assert_eq!(loaded.payload["current_step"], 1, "{name}");
            assert!(store.load("missing").await.unwrap().is_none(), "{name}");
        }
    }

    #[tokio::test]
    async fn save_replaces_but_keeps_created_at() {
        for (name, store) in backends().await {
            let first = record("i1", "approval_gate");
            store.save(&first).await.unwrap();

            let mut second = record("i1", "clarification_gate");
            second.created_at = first.created_at + chrono::Duration::seconds(5);
            second.updated_at = second.created_at;
            store.save(&second).await.unwrap();

            let loaded = store.load("i1").await.unwrap().expect(name);
            assert_eq!(loaded.stage, "clarification_gate", "{name}");
            assert_eq!(
                loaded.created_at.timestamp_millis(),
                first.created_at.timestamp_millis(),
                "{name}"
            );
            assert_eq!(store.list().await.unwrap().len(), 1, "{name}");
        }
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        for (name, store) in backends().await {
            store.save(&record("i1", "context_gate")).await.unwrap();
            assert!(store.delete("i1").await.unwrap(), "{name}");
            assert!(!store.delete("i1").await.unwrap(), "{name}");
            assert!(store.load("i1").await.unwrap().is_none(), "{name}");
        }
    }

    #[tokio::test]
    async fn sqlite_load_is_served_from_cache() {
        let store = SqliteCheckpointStore::new(Database::in_memory_migrated().await.unwrap());
        store.save(&record("i1", "approval_gate")).await.unwrap();

        store.load("i1").await.unwrap();
        store.load("i1").await.unwrap();
        assert_eq!(store.cache().stats().hits(), 1);
    }
}

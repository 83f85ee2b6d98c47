//! Workflow session persistence.
//!
//! A session is the durable trace of one workflow instance: metadata written
//! once at creation (the request, the engine settings) and a JSON state
//! object that accumulates partial updates as stages complete.  Updates are
//! merged key by key; a later value for a key replaces the earlier one.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::{Database, from_millis, to_millis};
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub metadata: Value,
    pub state: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
//  SessionStore
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a session and return its id (UUIDv7).
    #[instrument(skip(self, metadata))]
    pub async fn create_session(&self, metadata: Value) -> StoreResult<String> {
        let id = Uuid::now_v7().to_string();
        let metadata = serde_json::to_string(&metadata)?;
        let now = to_millis(Utc::now());

        let session_id = id.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, metadata, state, created_at, updated_at) \
                     VALUES (?1, ?2, '{}', ?3, ?3)",
                    rusqlite::params![session_id, metadata, now],
                )?;
                Ok(())
            })
            .await?;

        debug!(session_id = %id, "session created");
        Ok(id)
    }

    /// Merge the keys of `partial` (a JSON object) into the session state.
    #[instrument(skip(self, partial))]
    pub async fn update_session_state(&self, session_id: &str, partial: Value) -> StoreResult<()> {
        let Value::Object(partial) = partial else {
            return Err(StoreError::InvalidArgument(
                "session state update must be a JSON object".into(),
            ));
        };
        let id = session_id.to_string();
        let now = to_millis(Utc::now());

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row("SELECT state FROM sessions WHERE id = ?1", [&id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let Some(current) = current else {
                    return Err(StoreError::NotFound {
                        entity: "session",
                        id,
                    });
                };

                let mut state: Map<String, Value> = serde_json::from_str(&current)?;
                state.extend(partial);

                tx.execute(
                    "UPDATE sessions SET state = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![serde_json::to_string(&state)?, now, id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, session_id: &str) -> StoreResult<SessionRecord> {
        let id = session_id.to_string();
        let row = self
            .db
            .execute(move |conn| {
                let row: Option<(String, String, String, i64, i64)> = conn
                    .query_row(
                        "SELECT id, metadata, state, created_at, updated_at \
                         FROM sessions WHERE id = ?1",
                        [&id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                    )
                    .optional()?;
                row.ok_or(StoreError::NotFound {
                    entity: "session",
                    id,
                })
            })
            .await?;

        let (id, metadata, state, created_at, updated_at) = row;
        Ok(SessionRecord {
            id,
            metadata: serde_json::from_str(&metadata)?,
            state: serde_json::from_str(&state)?,
            created_at: from_millis("created_at", created_at)?,
            updated_at: from_millis("updated_at", updated_at)?,
        })
    }

    /// Returns `true` if the session existed.
    #[instrument(skip(self))]
    pub async fn delete(&self, session_id: &str) -> StoreResult<bool> {
        let id = session_id.to_string();
        let removed = self
            .db
            .execute(move |conn| Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?))
            .await?;
        Ok(removed > 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn store() -> SessionStore {
        SessionStore::new(Database::in_memory_migrated().await.unwrap())
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = store().await;
        let id = store
            .create_session(json!({"request": "What is 2+2?"}))
            .await
            .unwrap();

        let session = store.get(&id).await.unwrap();
        assert_eq!(session.metadata["request"], "What is 2+2?");
        assert!(session.state.is_empty());
    }

    #[tokio::test]
    async fn updates_merge_last_write_wins() {
        let store = store().await;
        let id = store.create_session(json!({})).await.unwrap();

        store
            .update_session_state(&id, json!({"current_step": 1, "last_task": "t1"}))
            .await
            .unwrap();
        store
            .update_session_state(&id, json!({"current_step": 2}))
            .await
            .unwrap();

        let state = store.get(&id).await.unwrap().state;
        assert_eq!(state["current_step"], 2);
        assert_eq!(state["last_task"], "t1");
    }

    #[tokio::test]
    async fn update_rejects_non_objects_and_unknown_ids() {
        let store = store().await;
        let id = store.create_session(json!({})).await.unwrap();

        let err = store.update_session_state(&id, json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let err = store
            .update_session_state("nope", json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "session", .. }));
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = store().await;
        let id = store.create_session(json!({})).await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(matches!(
            store.get(&id).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}

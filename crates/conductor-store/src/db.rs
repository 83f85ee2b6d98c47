//! SQLite handle shared by every store in this crate.
//!
//! [`Database`] owns a single `rusqlite::Connection` behind `Arc<Mutex<>>`.
//! Async callers never touch the connection directly: they pass a closure to
//! [`Database::execute`] (or [`Database::execute_mut`] for transactions),
//! which runs on tokio's blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Thread-safe handle to a SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and apply connection pragmas.
    ///
    /// Blocks on file I/O; prefer [`Database::open_and_migrate`] from async
    /// code.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InvalidArgument(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;
        Ok(Self::wrap(conn))
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");
        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;
        Ok(Self::wrap(conn))
    }

    /// Open the database file and bring its schema up to date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory database with the full schema applied.
    pub async fn in_memory_migrated() -> StoreResult<Self> {
        let db = Self::open_in_memory()?;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(migration::run_all).await
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// ```ignore
    /// let count: i64 = db
    ///     .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM worker_tasks", [], |r| r.get(0))?))
    ///     .await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            f(&conn)
        })
        .await?
    }

    /// Like [`Database::execute`] but hands out `&mut Connection`, so the
    /// closure can open a transaction.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            f(&mut conn)
        })
        .await?
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        // WAL lets the CLI read checkpoints while an engine is writing.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
        debug!("database pragmas applied");
        Ok(())
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

fn lock(conn: &Mutex<Connection>) -> StoreResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| StoreError::Poisoned)
}

// ── timestamp helpers ────────────────────────────────────────────────

/// Timestamps are stored as unix milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(column: &'static str, millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(StoreError::InvalidTimestamp { column, millis })
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .execute(|conn| Ok(conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn migrated_in_memory_has_schema() {
        let db = Database::in_memory_migrated().await.unwrap();
        for table in ["worker_tasks", "checkpoints", "sessions"] {
            let count: i64 = db
                .execute(move |conn| {
                    Ok(conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                        row.get(0)
                    })?)
                })
                .await
                .unwrap();
            assert_eq!(count, 0, "table {table}");
        }
    }

    #[tokio::test]
    async fn execute_mut_supports_transactions() {
        let db = Database::in_memory_migrated().await.unwrap();
        let inserted = db
            .execute_mut(|conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO sessions (id, metadata, state, created_at, updated_at) \
                     VALUES ('s1', '{}', '{}', 0, 0)",
                    [],
                )?;
                tx.commit()?;
                Ok(1)
            })
            .await
            .unwrap();
        assert_eq!(inserted, 1);
    }

    #[test]
    fn millis_round_trip_and_range() {
        let now = Utc::now();
        let back = from_millis("t", to_millis(now)).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
        assert!(matches!(
            from_millis("t", i64::MAX),
            Err(StoreError::InvalidTimestamp { column: "t", .. })
        ));
    }
}

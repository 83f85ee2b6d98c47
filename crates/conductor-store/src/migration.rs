//! Versioned schema migrations.
//!
//! Each migration is a static SQL batch with a version number.  Applied
//! versions are recorded in `_migrations`, so running the set twice is a
//! no-op.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append new migrations at the end; never edit an applied one.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "worker task records",
        sql: r#"
            CREATE TABLE worker_tasks (
                worker_id       TEXT NOT NULL,
                id              TEXT NOT NULL,
                name            TEXT NOT NULL,
                assigned_worker TEXT NOT NULL,
                description     TEXT NOT NULL,
                start_time      INTEGER NOT NULL,
                end_time        INTEGER,
                result          TEXT,
                error           TEXT,
                checkpoint      TEXT,
                interruptions   TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (worker_id, id)
            );
            CREATE INDEX idx_worker_tasks_start ON worker_tasks(start_time);
        "#,
    },
    Migration {
        version: 2,
        description: "workflow checkpoints for suspended and failed instances",
        sql: r#"
            CREATE TABLE checkpoints (
                instance_id TEXT PRIMARY KEY,
                stage       TEXT NOT NULL,
                status      TEXT NOT NULL,
                payload     TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_checkpoints_status ON checkpoints(status);
        "#,
    },
    Migration {
        version: 3,
        description: "workflow sessions",
        sql: r#"
            CREATE TABLE sessions (
                id         TEXT PRIMARY KEY,
                metadata   TEXT NOT NULL,
                state      TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Apply every migration newer than the recorded version.
///
/// Synchronous; call through [`crate::Database::execute`].
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(current_version = current, pending = pending.len(), "running migrations");
    for migration in pending {
        apply(conn, migration)?;
    }
    Ok(())
}

/// Latest applied migration version, or 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

/// Version of the newest migration compiled into this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let fail = |stage: &str, e: rusqlite::Error| StoreError::Migration {
        version: migration.version,
        message: format!("{stage}: {e}"),
    };

    info!(version = migration.version, description = migration.description, "applying migration");

    // `&Connection` cannot open a `Transaction`, so drive it by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail("begin", e))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| fail("sql", e))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    chrono::Utc::now().timestamp()
                ],
            )
            .map(|_| ())
            .map_err(|e| fail("record", e))
        });

    match result {
        Ok(()) => conn.execute_batch("COMMIT;").map_err(|e| fail("commit", e)),
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

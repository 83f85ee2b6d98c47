//! # conductor-store
//!
//! Persistence for the Conductor workflow engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  TaskStore        (memory | SQLite)           │
//! │  CheckpointStore  (memory | SQLite + HotCache)│
//! │  SessionStore     (SQLite)                    │
//! ├──────────────────────────────────────────────┤
//! │  HotCache (moka)                              │
//! ├──────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking)      │
//! │  Migrations (versioned, transactional)        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use conductor_store::{Database, SqliteTaskStore, Task, TaskStore};
//!
//! let db = Database::open_and_migrate("data/conductor.db").await?;
//! let tasks = SqliteTaskStore::new(db.clone());
//! tasks.put("HR", &Task::new("step_0_HR", "HR", "count staff")).await?;
//! ```

pub mod cache;
pub mod checkpoint;
pub mod db;
pub mod error;
pub mod migration;
pub mod session;
pub mod task;
pub mod task_store;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{CacheStats, HotCache};
pub use checkpoint::{CheckpointRecord, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use session::{SessionRecord, SessionStore};
pub use task::{Task, TaskStatus};
pub use task_store::{MemoryTaskStore, SqliteTaskStore, TaskStore};

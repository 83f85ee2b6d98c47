//! Failures surfaced by the task, checkpoint and session stores.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored payload (task checkpoint, workflow snapshot, session state)
    /// did not round-trip through JSON.
    #[error("payload encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema migration {version} did not apply: {message}")]
    Migration { version: u32, message: String },

    #[error("no {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("rejected by store: {0}")]
    InvalidArgument(String),

    /// Column holds milliseconds that chrono cannot represent.
    #[error("column {column} holds out-of-range timestamp {millis}")]
    InvalidTimestamp { column: &'static str, millis: i64 },

    /// A previous holder of the connection lock panicked.
    #[error("connection lock poisoned")]
    Poisoned,

    #[error("blocking database call aborted: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

//! Task records: one delegated (or directly executed) plan step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a [`Task`], derived from its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of work assigned to one worker.
///
/// The id is immutable and is the only key used when merging task lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub assigned_worker: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub checkpoint: Option<serde_json::Value>,
    #[serde(default)]
    pub interruptions: Vec<String>,
}

impl Task {
    /// A running task with a fresh UUIDv7 id, started now.
    pub fn new(
        name: impl Into<String>,
        assigned_worker: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            assigned_worker: assigned_worker.into(),
            description: description.into(),
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
            checkpoint: None,
            interruptions: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = at;
        self
    }

    pub fn complete(&mut self, result: impl Into<String>) {
        self.result = Some(result.into());
        self.error = None;
        self.end_time = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.end_time = Some(Utc::now());
    }

    /// Note that the task was paused for a human; the task keeps running.
    pub fn interrupt(&mut self, reason: impl Into<String>) {
        self.interruptions.push(reason.into());
    }

    pub fn status(&self) -> TaskStatus {
        match (&self.end_time, &self.error) {
            (None, _) => TaskStatus::Running,
            (Some(_), Some(_)) => TaskStatus::Failed,
            (Some(_), None) => TaskStatus::Completed,
        }
    }
}

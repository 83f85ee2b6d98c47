//! Workflow error types.
//!
//! Every engine subsystem surfaces errors through [`WorkflowError`].  Worker
//! failures are *not* errors at this level: the bus turns them into
//! `Error: ...` response texts that the coordinator records like any answer.

/// Unified error type for the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    // -- Oracle errors -------------------------------------------------------
    /// The language-model call failed (transport, HTTP status, or retries
    /// exhausted).
    #[error("oracle call failed: {reason}")]
    OracleFailed { reason: String },

    /// The provider answered but the payload could not be read.
    #[error("oracle response parse error: {reason}")]
    OracleParse { reason: String },

    /// A single oracle call exceeded its deadline.
    #[error("oracle call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    // -- Engine errors -------------------------------------------------------
    /// No suspended or failed instance is known under this id.
    #[error("no pending workflow instance: {instance_id}")]
    InstanceNotFound { instance_id: String },

    /// A decision was submitted for a gate of a different kind.
    #[error("decision mismatch: instance is waiting on {expected}, got a {got} decision")]
    GateMismatch { expected: String, got: String },

    /// The run performed more stage transitions than allowed.
    #[error("workflow {instance_id} exceeded {max} stage transitions")]
    StageLimitExceeded { instance_id: String, max: usize },

    /// A stored checkpoint could not be interpreted.
    #[error("corrupt checkpoint for {instance_id}: {reason}")]
    CorruptCheckpoint { instance_id: String, reason: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Serialization -------------------------------------------------------
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Upstream crate errors -----------------------------------------------
    #[error("store error: {0}")]
    Store(#[from] conductor_store::StoreError),

    #[error("kernel error: {0}")]
    Kernel(#[from] conductor_kernel::KernelError),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal workflow error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, WorkflowError>;

impl From<reqwest::Error> for WorkflowError {
    fn from(err: reqwest::Error) -> Self {
        Self::OracleFailed {
            reason: err.to_string(),
        }
    }
}

impl From<regex::Error> for WorkflowError {
    fn from(err: regex::Error) -> Self {
        Self::Internal(format!("invalid pattern: {err}"))
    }
}

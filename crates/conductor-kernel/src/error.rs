//! Kernel error types.
//!
//! Every fallible API in this crate returns [`KernelError`].  The message bus
//! never surfaces these to its callers: delivery failures are folded into the
//! response text so a workflow can keep running.

/// Unified error type for the Conductor kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Registry errors ----------------------------------------------------
    /// The requested worker is not registered.
    #[error("worker not found: {worker_id}")]
    WorkerNotFound {
        /// The id that was looked up.
        worker_id: String,
    },

    // -- Worker errors ------------------------------------------------------
    /// The worker handler ran but could not produce an answer.
    #[error("worker {worker_id} failed: {reason}")]
    WorkerFailed { worker_id: String, reason: String },

    // -- Keyword matcher errors ---------------------------------------------
    /// Building the internal automaton failed (e.g. invalid keyword set).
    #[error("keyword matcher build error: {reason}")]
    MatcherBuildError { reason: String },

    // -- Generic ------------------------------------------------------------
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;

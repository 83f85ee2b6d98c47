//! Conductor kernel.
//!
//! Shared services every workflow instance relies on:
//!
//! - **[`registry`]** -- Concurrent worker registry using [`DashMap`]: static
//!   [`WorkerProfile`]s plus the [`Worker`] endpoint used to reach each one.
//! - **[`bus`]** -- Message bus that delivers delegations to workers, keeps a
//!   bounded history and broadcasts every message over
//!   [`tokio::sync::broadcast`].
//! - **[`keywords`]** -- Aho-Corasick keyword matcher used for worker
//!   selection and the destructive-step approval policy.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and cheap to clone.
//!
//! [`DashMap`]: dashmap::DashMap

pub mod bus;
pub mod error;
pub mod keywords;
pub mod registry;

pub use bus::{AgentMessage, BusConfig, Delivery, MessageBus, MessageKind, is_error_response};
pub use error::{KernelError, Result};
pub use keywords::{KeywordMatch, KeywordMatcher};
pub use registry::{Worker, WorkerProfile, WorkerRegistry, WorkerRequest};

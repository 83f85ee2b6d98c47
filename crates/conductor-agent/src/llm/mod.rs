//! LLM integration layer.
//!
//! - [`types`] -- Provider-agnostic messages and requests.
//! - [`client`] -- HTTP client for the Anthropic and OpenAI APIs.
//! - [`oracle`] -- The [`Oracle`] seam the workflow stages call, with retry
//!   and scripted implementations.

pub mod client;
pub mod oracle;
pub mod types;

pub use client::{LlmClient, LlmClientConfig, LlmProvider};
pub use oracle::{LlmOracle, Oracle, RetryPolicy, RetryingOracle, ScriptedOracle};
pub use types::{ChatRequest, Completion, Message, Role, Usage};

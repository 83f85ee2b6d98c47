//! The language-model seam.
//!
//! Every engine stage that needs a model answer goes through [`Oracle`]:
//! prompt text in, answer text out.  [`LlmOracle`] adapts an [`LlmClient`],
//! [`RetryingOracle`] adds per-call deadlines and exponential backoff on top
//! of any oracle, and [`ScriptedOracle`] replays canned answers.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, WorkflowError};
use crate::llm::client::LlmClient;
use crate::llm::types::ChatRequest;

/// Text-completion service used by the workflow stages.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// LlmOracle
// ---------------------------------------------------------------------------

/// Sends each prompt as a single user turn through an [`LlmClient`].
#[derive(Debug, Clone)]
pub struct LlmOracle {
    client: LlmClient,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl LlmOracle {
    pub fn new(client: LlmClient) -> Self {
        Self {
            client,
            model: String::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
impl Oracle for LlmOracle {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest::prompt(self.model.clone(), prompt)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        let completion = self.client.chat(&request).await?;
        tracing::debug!(
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            stop_reason = completion.stop_reason.as_deref().unwrap_or("-"),
            "oracle answered"
        );
        Ok(completion.text)
    }
}

// ---------------------------------------------------------------------------
// RetryingOracle
// ---------------------------------------------------------------------------

/// Deadline and backoff settings for [`RetryingOracle`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry attempts after the first call (0 = no retries).
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub retry_backoff_factor: f64,
    /// Caps the backoff.
    pub max_retry_delay: Duration,
    /// Deadline for one call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_retry_delay: Duration::from_millis(500),
            retry_backoff_factor: 2.0,
            max_retry_delay: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.retry_backoff_factor)
                .min(self.max_retry_delay.as_secs_f64()),
        )
    }
}

/// Wraps an oracle with a per-call timeout and retries.
///
/// Configuration errors (a missing API key) are returned immediately; every
/// other failure is retried until the policy is exhausted, after which the
/// last error is returned.
pub struct RetryingOracle<O> {
    inner: O,
    policy: RetryPolicy,
}

impl<O: Oracle> RetryingOracle<O> {
    pub fn new(inner: O, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<O: Oracle> Oracle for RetryingOracle<O> {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut delay = self.policy.initial_retry_delay;
        let max_attempts = self.policy.max_retries + 1;
        let mut attempt = 1;

        loop {
            let err = match tokio::time::timeout(
                self.policy.call_timeout,
                self.inner.complete(prompt),
            )
            .await
            {
                Ok(Ok(answer)) => return Ok(answer),
                Ok(Err(e @ (WorkflowError::MissingApiKey { .. } | WorkflowError::Config { .. }))) => {
                    return Err(e);
                }
                Ok(Err(e)) => e,
                Err(_elapsed) => WorkflowError::Timeout {
                    secs: self.policy.call_timeout.as_secs(),
                },
            };

            if attempt >= max_attempts {
                tracing::warn!(attempt, error = %err, "oracle call failed, giving up");
                return Err(err);
            }

            tracing::warn!(attempt, max_attempts, error = %err, delay = ?delay, "oracle call failed, retrying");
            tokio::time::sleep(delay).await;
            delay = self.policy.next_delay(delay);
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedOracle
// ---------------------------------------------------------------------------

/// Answers prompts from a fixed script.
///
/// Each rule pairs a needle with a reply; the first rule whose needle occurs
/// in the prompt wins.  Prompts matching no rule get the fallback reply, or
/// an error when none is set.  Every prompt is recorded.
#[derive(Default)]
pub struct ScriptedOracle {
    rules: Vec<(String, String)>,
    fallback: Option<String>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push((needle.into(), reply.into()));
        self
    }

    pub fn otherwise(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Number of prompts answered or rejected so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_owned());
        }

        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| WorkflowError::OracleFailed {
                reason: "no scripted reply for prompt".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Multi-provider LLM client.
//!
//! Speaks the **Anthropic Messages API** and the **OpenAI Chat Completions
//! API** (which also covers OpenAI-compatible endpoints such as Ollama or
//! vLLM).  Only non-streaming completions are used by the workflow engine.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{Result, WorkflowError};
use crate::llm::types::{ChatRequest, Completion, Message, Role, Usage};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Wire dialect spoken by [`LlmClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
    /// OpenAI or any endpoint speaking its chat-completions dialect.
    OpenAI,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" | "openai_compatible" | "openai-compatible" => Ok(Self::OpenAI),
            other => Err(WorkflowError::Config {
                reason: format!("unknown llm provider `{other}`"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

/// Connection settings for a single provider endpoint.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub provider: LlmProvider,
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
    pub max_tokens: u32,
    /// Transport-level timeout for one HTTP request.
    pub request_timeout: Duration,
}

impl LlmClientConfig {
    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_owned(),
            default_model: model.into(),
            max_tokens: 4096,
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            base_url: OPENAI_BASE_URL.to_owned(),
            ..Self::anthropic(api_key, model)
        }
    }

    /// Any OpenAI-compatible API (Ollama, Together, vLLM, ...).
    pub fn openai_compatible(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::openai(api_key, model)
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for one LLM provider.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: Arc<LlmClientConfig>,
    http: reqwest::Client,
}

impl LlmClient {
    /// Fails with [`WorkflowError::MissingApiKey`] when the key is empty.
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(WorkflowError::MissingApiKey {
                provider: config.provider.as_str().into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| WorkflowError::OracleFailed {
                reason: format!("http client setup: {e}"),
            })?;

        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.config.provider
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    /// Send a chat request and wait for the full response.
    pub async fn chat(&self, request: &ChatRequest) -> Result<Completion> {
        let (url, headers, body) = match self.config.provider {
            LlmProvider::Anthropic => (
                format!("{}/v1/messages", self.config.base_url),
                self.anthropic_headers()?,
                self.build_anthropic_request_body(request),
            ),
            LlmProvider::OpenAI => (
                format!("{}/chat/completions", self.config.base_url),
                self.openai_headers()?,
                self.build_openai_request_body(request),
            ),
        };

        tracing::debug!(
            url = %url,
            model = %body["model"],
            provider = self.config.provider.as_str(),
            "sending LLM request"
        );

        let resp = self.http.post(&url).headers(headers).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| WorkflowError::OracleFailed {
            reason: format!("reading provider response: {e}"),
        })?;

        if !status.is_success() {
            return Err(WorkflowError::OracleFailed {
                reason: format!("provider answered {status}: {text}"),
            });
        }

        let v: Value = serde_json::from_str(&text).map_err(|e| WorkflowError::OracleParse {
            reason: format!("provider response is not JSON: {e}"),
        })?;

        match self.config.provider {
            LlmProvider::Anthropic => parse_anthropic_response(&v),
            LlmProvider::OpenAI => parse_openai_response(&v),
        }
    }

    // -- Anthropic -----------------------------------------------------------

    fn anthropic_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key).map_err(|e| {
                WorkflowError::OracleFailed {
                    reason: format!("x-api-key header rejected: {e}"),
                }
            })?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_anthropic_request_body(&self, request: &ChatRequest) -> Value {
        let (system, messages) = messages_to_anthropic(&request.messages);

        let mut body = json!({
            "model": self.model_for(request),
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    // -- OpenAI --------------------------------------------------------------

    fn openai_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", self.config.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value).map_err(|e| WorkflowError::OracleFailed {
                reason: format!("bearer header rejected: {e}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_openai_request_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.model_for(request),
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages,
        });
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    fn model_for<'a>(&'a self, request: &'a ChatRequest) -> &'a str {
        if request.model.is_empty() {
            &self.config.default_model
        } else {
            &request.model
        }
    }
}

// ===========================================================================
// Wire format conversion
// ===========================================================================

/// Split system messages out (Anthropic takes them as a top-level field) and
/// convert the rest.
fn messages_to_anthropic(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => match &mut system {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },
            Role::User | Role::Assistant => {
                wire.push(json!({ "role": msg.role.as_str(), "content": msg.content }));
            }
        }
    }

    (system, wire)
}

fn parse_anthropic_response(v: &Value) -> Result<Completion> {
    let content = v["content"]
        .as_array()
        .ok_or_else(|| WorkflowError::OracleParse {
            reason: "response has no `content` blocks".into(),
        })?;

    let text = content
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect::<String>();

    Ok(Completion {
        text,
        usage: Usage {
            input_tokens: token_count(&v["usage"]["input_tokens"]),
            output_tokens: token_count(&v["usage"]["output_tokens"]),
        },
        stop_reason: v["stop_reason"].as_str().map(str::to_owned),
    })
}

fn parse_openai_response(v: &Value) -> Result<Completion> {
    let choice = &v["choices"][0];
    let message = &choice["message"];
    if message.is_null() {
        return Err(WorkflowError::OracleParse {
            reason: "response has no `choices[0].message`".into(),
        });
    }

    Ok(Completion {
        text: message["content"].as_str().unwrap_or_default().to_owned(),
        usage: Usage {
            input_tokens: token_count(&v["usage"]["prompt_tokens"]),
            output_tokens: token_count(&v["usage"]["completion_tokens"]),
        },
        stop_reason: choice["finish_reason"].as_str().map(str::to_owned),
    })
}

fn token_count(v: &Value) -> u32 {
    v.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0)
}

// ===========================================================================
// Tests
// ===========================================================================

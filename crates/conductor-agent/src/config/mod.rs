//! Engine configuration.
//!
//! Configuration is layered:
//!
//! 1. the built-in `default.toml`, compiled into the crate;
//! 2. an optional user file, merged over the defaults table by table;
//! 3. environment overrides (`CONDUCTOR_*` and the provider API keys).
//!
//! A `[[workers]]` array in the user file replaces the built-in worker list
//! rather than extending it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use conductor_kernel::WorkerProfile;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, WorkflowError};
use crate::executor::ExecutorConfig;
use crate::llm::{LlmProvider, RetryPolicy};
use crate::planner::PlannerConfig;
use crate::state::Confidence;

const DEFAULT_CONFIG: &str = include_str!("default.toml");

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Master switch for every human-in-the-loop gate.
    pub enable_hitl: bool,
    /// Worker id that plans and takes untagged steps.
    pub orchestrator: String,
    /// Step answers scoring below this (0-100) wait for a human.
    pub confidence_threshold: u32,
    pub context_window: usize,
    pub max_plan_steps: usize,
    /// Stage transitions one `start`/`resolve` call may run before failing.
    pub max_transitions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSection {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub retry_backoff_factor: f64,
    pub max_retry_delay_ms: u64,
    /// Only ever read from the environment.
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// SQLite file.  Unset means in-memory stores.
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub task_ttl_hours: u64,
    pub checkpoint_cache_capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSection {
    pub keywords: Vec<String>,
}

/// One `[[workers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub can_multi_step_plan: bool,
    #[serde(default)]
    pub hitl_enabled: bool,
    /// Words in a step that route it to this worker.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Words in a whole request that skip planning and go straight here.
    #[serde(default)]
    pub direct_keywords: Vec<String>,
    /// Requests mentioning none of these are declined by the worker.
    /// Empty accepts everything.
    #[serde(default)]
    pub domain_keywords: Vec<String>,
}

impl WorkerConfig {
    pub fn profile(&self) -> WorkerProfile {
        WorkerProfile::new(&self.id, &self.name)
            .with_description(&self.description)
            .with_capabilities(self.capabilities.iter().cloned())
            .with_multi_step_planning(self.can_multi_step_plan)
            .with_hitl(self.hitl_enabled)
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub oracle: OracleSection,
    pub store: StoreSection,
    pub approval: ApprovalSection,
    pub workers: Vec<WorkerConfig>,
}

impl EngineConfig {
    /// The built-in configuration, without environment overrides.
    pub fn builtin() -> Result<Self> {
        Self::from_layers(None)
    }

    /// Parse `overlay` (TOML text) over the built-in configuration.
    pub fn from_toml_str(overlay: &str) -> Result<Self> {
        Self::from_layers(Some(overlay))
    }

    /// Load the built-in configuration, the file at `path` if given, and the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let overlay = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|e| WorkflowError::Config {
                    reason: format!("failed to read {}: {e}", path.display()),
                })?;
                info!(path = %path.display(), "loaded configuration file");
                Some(text)
            }
            Some(path) => {
                warn!(path = %path.display(), "configuration file not found, using defaults");
                None
            }
            None => None,
        };

        let mut config = Self::from_layers(overlay.as_deref())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_layers(overlay: Option<&str>) -> Result<Self> {
        let mut table = parse_table(DEFAULT_CONFIG, "built-in configuration")?;
        if let Some(text) = overlay {
            merge(&mut table, parse_table(text, "configuration file")?);
        }
        let config = toml::Value::Table(table)
            .try_into::<Self>()
            .map_err(|e: toml::de::Error| WorkflowError::Config {
                reason: format!("invalid configuration: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("CONDUCTOR_ENABLE_HITL") {
            self.engine.enable_hitl = parse_bool(&value).ok_or_else(|| WorkflowError::Config {
                reason: format!("CONDUCTOR_ENABLE_HITL must be true or false, got `{value}`"),
            })?;
            debug!(enable_hitl = self.engine.enable_hitl, "HITL switch from environment");
        }
        if let Some(path) = lookup("CONDUCTOR_DB_PATH").filter(|p| !p.is_empty()) {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(model) = lookup("CONDUCTOR_MODEL").filter(|m| !m.is_empty()) {
            self.oracle.model = model;
        }

        let key_var = match self.provider()? {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenAI => "OPENAI_API_KEY",
        };
        if let Some(key) = lookup(key_var).filter(|k| !k.is_empty()) {
            self.oracle.api_key = Some(key);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(WorkflowError::Config { reason });

        if self.engine.confidence_threshold > 100 {
            return fail(format!(
                "confidence_threshold must be 0-100, got {}",
                self.engine.confidence_threshold
            ));
        }
        if self.engine.max_transitions == 0 {
            return fail("max_transitions must be at least 1".into());
        }
        if self.engine.max_plan_steps == 0 {
            return fail("max_plan_steps must be at least 1".into());
        }
        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.id.as_str()) {
                return fail(format!("duplicate worker id `{}`", worker.id));
            }
        }
        if !seen.contains(self.engine.orchestrator.as_str()) {
            return fail(format!(
                "orchestrator `{}` is not among the configured workers",
                self.engine.orchestrator
            ));
        }
        self.provider()?;
        Ok(())
    }

    pub fn provider(&self) -> Result<LlmProvider> {
        self.oracle.provider.parse()
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.oracle.max_retries,
            initial_retry_delay: Duration::from_millis(self.oracle.initial_retry_delay_ms),
            retry_backoff_factor: self.oracle.retry_backoff_factor,
            max_retry_delay: Duration::from_millis(self.oracle.max_retry_delay_ms),
            call_timeout: Duration::from_secs(self.oracle.timeout_secs),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            confidence_threshold: Confidence::new(self.engine.confidence_threshold),
            context_window: self.engine.context_window,
            hitl_enabled: self.engine.enable_hitl,
        }
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            orchestrator: self.engine.orchestrator.clone(),
            max_steps: self.engine.max_plan_steps,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_table(text: &str, what: &str) -> Result<toml::Table> {
    toml::from_str(text).map_err(|e| WorkflowError::Config {
        reason: format!("failed to parse {what}: {e}"),
    })
}

/// Merge `overlay` into `base`.  Nested tables merge key by key; any other
/// value (arrays included) replaces what was there.
fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(inner) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge(existing, inner);
                continue;
            }
            base.insert(key, toml::Value::Table(inner));
        } else {
            base.insert(key, value);
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

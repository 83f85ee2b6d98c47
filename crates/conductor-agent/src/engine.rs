//! The workflow engine.
//!
//! One [`Engine`] drives any number of workflow instances.  Each instance is
//! a cooperative state machine: the [`Router`] names a stage, the stage runs
//! and returns a [`StateUpdate`], the update is merged, and the router is
//! asked again.  A run ends in one of three ways:
//!
//! - a terminal stage ran: [`RunOutcome::Completed`];
//! - the router named a gate: the state is checkpointed and the instance
//!   waits in the pending table ([`RunOutcome::Suspended`]) until
//!   [`Engine::resolve`];
//! - a stage failed: the state before the failing stage is checkpointed
//!   ([`RunOutcome::Failed`]) and [`Engine::retry`] re-runs it.
//!
//! Checkpoints live in the injected [`CheckpointStore`]; after a restart
//! [`Engine::recover`] rebuilds the pending table from them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_kernel::{MessageBus, WorkerRegistry};
use conductor_store::{
    CheckpointRecord, CheckpointStore, Database, MemoryCheckpointStore, MemoryTaskStore, SessionStore,
    SqliteCheckpointStore, SqliteTaskStore, TaskStore,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::classifier::Classifier;
use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::error::{Result, WorkflowError};
use crate::executor::StepExecutor;
use crate::gates::{Decision, GatePrompt, apply_decision, prompt_for};
use crate::llm::types::Message;
use crate::llm::{LlmClient, LlmClientConfig, LlmOracle, LlmProvider, Oracle, RetryingOracle};
use crate::planner::Planner;
use crate::policy::{ApprovalPolicy, WorkerSelector};
use crate::router::{Router, Stage};
use crate::state::{StateUpdate, WorkflowState};
use crate::workers::register_oracle_workers;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How a `start`, `resolve` or `retry` call ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed {
        instance_id: String,
        answer: String,
        state: Box<WorkflowState>,
    },
    Suspended {
        instance_id: String,
        gate: Stage,
        prompt: GatePrompt,
    },
    Failed {
        instance_id: String,
        stage: Stage,
        reason: String,
    },
}

impl RunOutcome {
    pub fn instance_id(&self) -> &str {
        match self {
            Self::Completed { instance_id, .. }
            | Self::Suspended { instance_id, .. }
            | Self::Failed { instance_id, .. } => instance_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    AwaitingHuman,
    Failed,
}

impl PendingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingHuman => "awaiting_human",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting_human" => Some(Self::AwaitingHuman),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instance that stopped short of a terminal stage.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub instance_id: String,
    /// The gate it waits at, or the stage that failed.
    pub stage: Stage,
    pub status: PendingStatus,
    /// Set for suspended instances.
    pub prompt: Option<GatePrompt>,
    /// Set for failed instances.
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint payload.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    state: WorkflowState,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    router: Router,
    classifier: Classifier,
    planner: Planner,
    coordinator: Coordinator,
    aggregator: Aggregator,
    oracle: Arc<dyn Oracle>,
    registry: WorkerRegistry,
    bus: MessageBus,
    tasks: Arc<dyn TaskStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    sessions: Option<SessionStore>,
    pending: DashMap<String, PendingRequest>,
    config: EngineConfig,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Build an engine from configuration alone: the configured LLM
    /// provider, oracle-backed workers and SQLite stores when a database
    /// path is set (in-memory stores otherwise).
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let oracle = oracle_from_config(&config)?;
        let mut builder = Self::builder(config.clone()).oracle(oracle);

        if let Some(path) = config.store.path.clone() {
            let db = Database::open_and_migrate(path).await?;
            builder = builder
                .task_store(Arc::new(SqliteTaskStore::new(db.clone())))
                .checkpoint_store(Arc::new(SqliteCheckpointStore::with_cache_capacity(
                    db.clone(),
                    config.store.checkpoint_cache_capacity,
                )))
                .sessions(SessionStore::new(db));
        }
        builder.build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    /// Start a new instance for `request` and run it until it completes,
    /// suspends or fails.
    pub async fn start(&self, request: impl Into<String>) -> Result<RunOutcome> {
        let request = request.into();
        let instance_id = Uuid::now_v7().to_string();
        info!(instance = %instance_id, "workflow started");

        let session_id = self.open_session(&request).await;
        self.drive(instance_id, WorkflowState::new(request), session_id).await
    }

    /// Apply a human decision to a suspended instance and continue it.
    ///
    /// The pending entry is taken out of the table before anything else, so
    /// concurrent resolvers of one suspension cannot both resume it; the
    /// loser gets [`WorkflowError::InstanceNotFound`].  A rejected decision
    /// puts the entry back.
    pub async fn resolve(&self, instance_id: &str, decision: Decision) -> Result<RunOutcome> {
        let pending = self.take_pending(instance_id)?;

        if pending.status != PendingStatus::AwaitingHuman || pending.stage != decision.gate() {
            let expected = match pending.status {
                PendingStatus::Failed => "retry".to_owned(),
                PendingStatus::AwaitingHuman => pending.stage.to_string(),
            };
            self.pending.insert(instance_id.to_owned(), pending);
            return Err(WorkflowError::GateMismatch {
                expected,
                got: decision.kind().to_owned(),
            });
        }

        let resumed = match self.load_snapshot(instance_id).await {
            Ok(snapshot) => apply_decision(pending.stage, &snapshot.state, &decision).map(|update| {
                let mut state = snapshot.state;
                state.apply(update);
                (state, snapshot.session_id)
            }),
            Err(err) => Err(err),
        };
        let (state, session_id) = match resumed {
            Ok(resumed) => resumed,
            Err(err) => {
                self.pending.insert(instance_id.to_owned(), pending);
                return Err(err);
            }
        };

        info!(instance = %instance_id, gate = %pending.stage, decision = decision.kind(), "workflow resumed");
        self.drive(instance_id.to_owned(), state, session_id).await
    }

    /// Re-run the stage a failed instance stopped at.
    pub async fn retry(&self, instance_id: &str) -> Result<RunOutcome> {
        let pending = self.take_pending(instance_id)?;
        if pending.status != PendingStatus::Failed {
            let expected = pending.stage.to_string();
            self.pending.insert(instance_id.to_owned(), pending);
            return Err(WorkflowError::GateMismatch {
                expected,
                got: "retry".into(),
            });
        }

        let snapshot = match self.load_snapshot(instance_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.pending.insert(instance_id.to_owned(), pending);
                return Err(err);
            }
        };
        info!(instance = %instance_id, stage = %pending.stage, "retrying failed stage");
        self.drive(instance_id.to_owned(), snapshot.state, snapshot.session_id)
            .await
    }

    /// Drop a suspended or failed instance and its checkpoint.
    pub async fn cancel(&self, instance_id: &str) -> Result<()> {
        let had_entry = self.pending.remove(instance_id).is_some();
        let had_checkpoint = self.checkpoints.delete(instance_id).await?;
        if !had_entry && !had_checkpoint {
            return Err(WorkflowError::InstanceNotFound {
                instance_id: instance_id.to_owned(),
            });
        }
        info!(instance = %instance_id, "workflow cancelled");
        Ok(())
    }

    /// Suspended and failed instances, oldest first.
    pub fn pending(&self) -> Vec<PendingRequest> {
        let mut all: Vec<PendingRequest> = self.pending.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|p| p.created_at);
        all
    }

    /// Rebuild the pending table from stored checkpoints.  Unreadable
    /// checkpoints are skipped with a warning.  Returns how many instances
    /// were restored.
    pub async fn recover(&self) -> Result<usize> {
        let mut restored = 0;
        for record in self.checkpoints.list().await? {
            match pending_from_record(&record) {
                Ok(pending) => {
                    self.pending.insert(record.instance_id.clone(), pending);
                    restored += 1;
                }
                Err(err) => warn!(instance = %record.instance_id, error = %err, "skipping checkpoint"),
            }
        }
        if restored > 0 {
            info!(restored, "pending workflows recovered");
        }
        Ok(restored)
    }

    // -- Internals -----------------------------------------------------------

    async fn drive(
        &self,
        instance_id: String,
        mut state: WorkflowState,
        session_id: Option<String>,
    ) -> Result<RunOutcome> {
        let max = self.config.engine.max_transitions;

        for _ in 0..max {
            let stage = self.router.next(&state);
            if stage.is_gate() {
                return self.suspend(instance_id, stage, state, session_id).await;
            }

            info!(instance = %instance_id, %stage, step = state.current_step, "stage started");
            let update = match self.run_stage(stage, &state).await {
                Ok(update) => update,
                Err(err) => return self.fail(instance_id, stage, state, session_id, err).await,
            };
            state.apply(update);
            self.record_session(session_id.as_deref(), stage, &state).await;

            // A held direct request goes on to the approval gate.
            if stage.is_terminal() && state.pending_approval.is_none() {
                return self.complete(instance_id, state).await;
            }
        }

        // Keep what the run accumulated; `retry` resumes with a fresh budget.
        warn!(instance = %instance_id, max, "transition limit reached");
        let stage = self.router.next(&state);
        let err = WorkflowError::StageLimitExceeded {
            instance_id: instance_id.clone(),
            max,
        };
        self.fail(instance_id, stage, state, session_id, err).await
    }

    async fn run_stage(&self, stage: Stage, state: &WorkflowState) -> Result<StateUpdate> {
        match stage {
            Stage::Classify => self.classifier.classify(state).await,
            Stage::Simple => self.simple(state).await,
            Stage::DirectDelegate => self.coordinator.direct(state).await,
            Stage::CreatePlan => self.planner.create_plan(state).await,
            Stage::Coordinate => self.coordinator.coordinate(state).await,
            Stage::Aggregate => self.aggregator.aggregate(state).await,
            gate => Err(WorkflowError::Internal(format!("{gate} is not an executable stage"))),
        }
    }

    /// Answer a simple request straight from the conversation.
    async fn simple(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let transcript = state
            .history
            .iter()
            .map(Message::transcript_line)
            .collect::<Vec<_>>()
            .join("\n");
        let answer = self
            .oracle
            .complete(&format!(
                "Continue this conversation with a direct, helpful reply to the last user message.\n\n\
                 {transcript}\n\nassistant:"
            ))
            .await?;
        Ok(StateUpdate::new().message(Message::assistant(answer.trim())))
    }

    async fn suspend(
        &self,
        instance_id: String,
        gate: Stage,
        state: WorkflowState,
        session_id: Option<String>,
    ) -> Result<RunOutcome> {
        let prompt = prompt_for(gate, &state);
        let record = CheckpointRecord::new(
            &instance_id,
            gate.as_str(),
            PendingStatus::AwaitingHuman.as_str(),
            serde_json::to_value(Snapshot {
                state,
                session_id,
                reason: None,
            })?,
        );
        self.checkpoints.save(&record).await?;
        self.pending.insert(
            instance_id.clone(),
            PendingRequest {
                instance_id: instance_id.clone(),
                stage: gate,
                status: PendingStatus::AwaitingHuman,
                prompt: Some(prompt.clone()),
                reason: None,
                created_at: record.created_at,
            },
        );

        info!(instance = %instance_id, %gate, "workflow suspended");
        Ok(RunOutcome::Suspended {
            instance_id,
            gate,
            prompt,
        })
    }

    async fn fail(
        &self,
        instance_id: String,
        stage: Stage,
        state: WorkflowState,
        session_id: Option<String>,
        err: WorkflowError,
    ) -> Result<RunOutcome> {
        let reason = err.to_string();
        warn!(instance = %instance_id, %stage, error = %reason, "stage failed");

        let record = CheckpointRecord::new(
            &instance_id,
            stage.as_str(),
            PendingStatus::Failed.as_str(),
            serde_json::to_value(Snapshot {
                state,
                session_id,
                reason: Some(reason.clone()),
            })?,
        );
        self.checkpoints.save(&record).await?;
        self.pending.insert(
            instance_id.clone(),
            PendingRequest {
                instance_id: instance_id.clone(),
                stage,
                status: PendingStatus::Failed,
                prompt: None,
                reason: Some(reason.clone()),
                created_at: record.created_at,
            },
        );

        Ok(RunOutcome::Failed {
            instance_id,
            stage,
            reason,
        })
    }

    async fn complete(&self, instance_id: String, state: WorkflowState) -> Result<RunOutcome> {
        // Resumed instances leave a checkpoint behind.
        if self.checkpoints.delete(&instance_id).await? {
            debug!(instance = %instance_id, "checkpoint removed");
        }
        let answer = state.final_answer().unwrap_or_default().to_owned();
        info!(
            instance = %instance_id,
            tasks = state.tasks.len(),
            workers = ?state.contributing_workers(),
            "workflow completed"
        );
        Ok(RunOutcome::Completed {
            instance_id,
            answer,
            state: Box::new(state),
        })
    }

    fn take_pending(&self, instance_id: &str) -> Result<PendingRequest> {
        self.pending
            .remove(instance_id)
            .map(|(_, pending)| pending)
            .ok_or_else(|| WorkflowError::InstanceNotFound {
                instance_id: instance_id.to_owned(),
            })
    }

    async fn load_snapshot(&self, instance_id: &str) -> Result<Snapshot> {
        let record = self
            .checkpoints
            .load(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound {
                instance_id: instance_id.to_owned(),
            })?;
        decode_snapshot(&record)
    }

    // -- Sessions ------------------------------------------------------------
    //
    // Session persistence is best effort: a failing session store only
    // costs the trace, never the run.

    async fn open_session(&self, request: &str) -> Option<String> {
        let sessions = self.sessions.as_ref()?;
        let metadata = json!({
            "request": request,
            "hitl_enabled": self.config.engine.enable_hitl,
            "orchestrator": self.config.engine.orchestrator,
        });
        match sessions.create_session(metadata).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "failed to create session");
                None
            }
        }
    }

    async fn record_session(&self, session_id: Option<&str>, stage: Stage, state: &WorkflowState) {
        let (Some(sessions), Some(session_id)) = (self.sessions.as_ref(), session_id) else {
            return;
        };
        let partial = match serde_json::to_value(state) {
            Ok(value) => json!({ "last_stage": stage, "state": value }),
            Err(err) => {
                warn!(error = %err, "failed to serialize state for session");
                return;
            }
        };
        if let Err(err) = sessions.update_session_state(session_id, partial).await {
            warn!(session = %session_id, error = %err, "failed to update session");
        }
    }
}

fn decode_snapshot(record: &CheckpointRecord) -> Result<Snapshot> {
    serde_json::from_value(record.payload.clone()).map_err(|e| WorkflowError::CorruptCheckpoint {
        instance_id: record.instance_id.clone(),
        reason: e.to_string(),
    })
}

fn pending_from_record(record: &CheckpointRecord) -> Result<PendingRequest> {
    let corrupt = |reason: String| WorkflowError::CorruptCheckpoint {
        instance_id: record.instance_id.clone(),
        reason,
    };
    let stage: Stage = record
        .stage
        .parse()
        .map_err(|_| corrupt(format!("unknown stage `{}`", record.stage)))?;
    let status = PendingStatus::parse(&record.status)
        .ok_or_else(|| corrupt(format!("unknown status `{}`", record.status)))?;
    let snapshot = decode_snapshot(record)?;

    Ok(PendingRequest {
        instance_id: record.instance_id.clone(),
        stage,
        status,
        prompt: (status == PendingStatus::AwaitingHuman).then(|| prompt_for(stage, &snapshot.state)),
        reason: snapshot.reason,
        created_at: record.created_at,
    })
}

/// The retrying LLM oracle described by `config.oracle`.
pub fn oracle_from_config(config: &EngineConfig) -> Result<Arc<dyn Oracle>> {
    let oracle = &config.oracle;
    let key = oracle.api_key.clone().unwrap_or_default();
    let mut client_config = match config.provider()? {
        LlmProvider::Anthropic => LlmClientConfig::anthropic(key, &oracle.model),
        LlmProvider::OpenAI => LlmClientConfig::openai(key, &oracle.model),
    }
    .with_max_tokens(oracle.max_tokens)
    .with_request_timeout(Duration::from_secs(oracle.timeout_secs));
    if let Some(base_url) = &oracle.base_url {
        client_config.base_url = base_url.clone();
    }

    let mut llm = LlmOracle::new(LlmClient::new(client_config)?).with_max_tokens(oracle.max_tokens);
    if let Some(temperature) = oracle.temperature {
        llm = llm.with_temperature(temperature);
    }
    Ok(Arc::new(RetryingOracle::new(llm, config.retry_policy())))
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles an [`Engine`].  Only the oracle is required; everything else
/// defaults to in-memory implementations and the configured workers.
pub struct EngineBuilder {
    config: EngineConfig,
    oracle: Option<Arc<dyn Oracle>>,
    registry: Option<WorkerRegistry>,
    bus: Option<MessageBus>,
    tasks: Option<Arc<dyn TaskStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    sessions: Option<SessionStore>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            oracle: None,
            registry: None,
            bus: None,
            tasks: None,
            checkpoints: None,
            sessions: None,
        }
    }

    pub fn oracle(mut self, oracle: Arc<dyn Oracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Use a pre-populated registry instead of oracle-backed workers.
    pub fn registry(mut self, registry: WorkerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Must share the engine's registry.
    pub fn bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;
        let oracle = self.oracle.ok_or_else(|| WorkflowError::Config {
            reason: "engine needs an oracle".into(),
        })?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let registry = WorkerRegistry::new();
                register_oracle_workers(&registry, &config.workers, &oracle)?;
                registry
            }
        };
        let orchestrator = config.engine.orchestrator.clone();
        if !registry.contains(&orchestrator) {
            return Err(WorkflowError::Config {
                reason: format!("orchestrator `{orchestrator}` is not registered"),
            });
        }
        let bus = self.bus.unwrap_or_else(|| MessageBus::new(registry.clone()));
        let tasks = self.tasks.unwrap_or_else(|| Arc::new(MemoryTaskStore::new()));
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()));

        let mut selector = WorkerSelector::builder(registry.clone(), orchestrator.clone());
        for worker in &config.workers {
            if !worker.keywords.is_empty() {
                selector = selector.keywords(&worker.id, worker.keywords.iter().cloned());
            }
            if !worker.direct_keywords.is_empty() {
                selector = selector.direct_keywords(&worker.id, worker.direct_keywords.iter().cloned());
            }
        }
        let selector = selector.build()?;
        let policy = ApprovalPolicy::new(config.approval.keywords.iter().cloned())?;
        let hitl = config.engine.enable_hitl;

        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&oracle),
            policy.clone(),
            config.executor_config(),
        )?);

        info!(
            workers = registry.count(),
            %orchestrator,
            hitl,
            sessions = self.sessions.is_some(),
            "engine ready"
        );

        Ok(Engine {
            router: Router::new(hitl, selector.clone()),
            classifier: Classifier::new(Arc::clone(&oracle)),
            planner: Planner::new(Arc::clone(&oracle), registry.clone(), config.planner_config())?,
            coordinator: Coordinator::new(selector, bus.clone(), Arc::clone(&tasks), executor, policy, hitl),
            aggregator: Aggregator::new(Arc::clone(&oracle), registry.clone(), orchestrator),
            oracle,
            registry,
            bus,
            tasks,
            checkpoints,
            sessions: self.sessions,
            pending: DashMap::new(),
            config,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

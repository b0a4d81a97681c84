//! Workflow runtime: push-based traversal of a compiled graph.
//!
//! One driver per run owns the `WorkflowState`. Step nodes are spawned on a
//! `JoinSet` with a snapshot of the context; completions come back to the
//! driver, which applies their context patch, records the result, writes a
//! checkpoint and pushes the successors. Join nodes run inline on every
//! arrival. Conditional edges pick exactly one successor from the branch
//! step's recorded output.
//!
//! # Run flow
//!
//! 1. Resolve the compiled graph through the `GraphCache`.
//! 2. Build a fresh state, or restore one from a checkpoint (resume).
//! 3. Create or refresh the run record; emit "flow started".
//! 4. Traverse from `__start__` until nothing is ready or in flight.
//! 5. Final checkpoint, run record, "flow completed", `RunResult`.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::config::EngineConfig;
use weft_types::flow::{FailurePolicy, FlowDefinition, FlowKey};
use weft_types::log::{LogEntry, LogLevel, LogTags};
use weft_types::run::{CheckpointStatus, RunRecord, RunResult, RunStatus};

use crate::repository::run::RunStore;

use super::cache::GraphCache;
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::compiler::CompileError;
use super::graph::{CompiledGraph, GraphNode, END, START};
use super::join::{arrive, JoinArrival};
use super::log::LogSink;
use super::path::set_key;
use super::state::WorkflowState;
use super::step_executor::{StepExecutor, StepOutcome};

// ---------------------------------------------------------------------------
// Options and errors
// ---------------------------------------------------------------------------

/// Per-run request.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Initial context. Non-object inputs are wrapped under `input`.
    pub input: Value,
    /// Resume from this checkpoint instead of starting fresh. The run keeps
    /// the checkpoint's run ID.
    pub resume_from: Option<Uuid>,
    /// Run ID for a fresh run; generated when absent.
    pub run_id: Option<Uuid>,
    pub session: Option<String>,
    /// Merged into the context under `run`.
    pub metadata: Map<String, Value>,
}

/// Traversal-level failures. Step failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("state restore failed: {0}")]
    StateRestore(String),

    #[error("step task failed: {0}")]
    TaskFailed(String),

    #[error("checkpoint belongs to flow {found}, not {expected}")]
    FlowMismatch { expected: FlowKey, found: FlowKey },
}

// ---------------------------------------------------------------------------
// FlowRuntime
// ---------------------------------------------------------------------------

/// Generic over `S: RunStore` for storage flexibility.
pub struct FlowRuntime<S: RunStore> {
    cache: Arc<GraphCache>,
    executor: Arc<StepExecutor>,
    checkpoints: CheckpointManager<S>,
    config: EngineConfig,
    logs: Arc<dyn LogSink>,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

/// What the driver learned from a traversal.
struct Traversal {
    /// Step whose failure stopped the run under the halt policy.
    halted_by: Option<String>,
}

impl<S: RunStore> FlowRuntime<S> {
    /// Runtime with its own graph cache sized from `config`. The executor's
    /// log sink receives the run-level events too.
    pub fn new(store: Arc<S>, executor: StepExecutor, config: EngineConfig) -> Self {
        let logs = executor.log_sink();
        Self {
            cache: Arc::new(GraphCache::new(config.graph_cache_capacity)),
            executor: Arc::new(executor),
            checkpoints: CheckpointManager::new(store),
            config,
            logs,
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Share a process-wide graph cache.
    pub fn with_graph_cache(mut self, cache: Arc<GraphCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        self.checkpoints.store()
    }

    pub fn cache(&self) -> &Arc<GraphCache> {
        &self.cache
    }

    /// Trigger cancellation of an in-flight run. Returns `false` when the run
    /// is not executing in this runtime.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancellation_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Execute a flow, fresh or resumed, and return its result.
    ///
    /// Step failures are reported in the result; only compile errors,
    /// checkpoint loading and traversal-level failures return `Err`.
    pub async fn run(
        &self,
        flow: &FlowDefinition,
        options: RunOptions,
    ) -> Result<RunResult, RuntimeError> {
        let graph = self.cache.get_or_compile(flow).await?;
        let key = flow.key();
        let started = Instant::now();
        let started_at = Utc::now();

        let (run_id, mut state, resumed) = match options.resume_from {
            Some(checkpoint_id) => {
                let checkpoint = self.checkpoints.load(checkpoint_id).await?;
                let found = FlowKey {
                    flow_id: checkpoint.flow_id,
                    version: checkpoint.flow_version,
                };
                if found != key {
                    return Err(RuntimeError::FlowMismatch {
                        expected: key,
                        found,
                    });
                }
                let run_id = checkpoint.run_id;
                match WorkflowState::restore(checkpoint.state) {
                    Ok(mut state) => {
                        let cleared = state.prepare_resume(&graph);
                        tracing::info!(
                            run_id = %run_id,
                            checkpoint_id = %checkpoint_id,
                            cleared = cleared.len(),
                            "resuming run from checkpoint"
                        );
                        (run_id, state, true)
                    }
                    Err(e) => {
                        let error = RuntimeError::StateRestore(e.to_string());
                        self.fail_run(run_id, key, started_at, &error).await;
                        return Err(error);
                    }
                }
            }
            None => {
                let run_id = options.run_id.unwrap_or_else(Uuid::now_v7);
                let state = WorkflowState::new(initial_context(flow, run_id, &options));
                (run_id, state, false)
            }
        };

        let tags = LogTags {
            session: options.session.clone(),
            ..LogTags::run(run_id)
        };
        let cancel = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, cancel.clone());

        let record = RunRecord {
            run_id,
            flow_id: key.flow_id,
            flow_version: key.version,
            status: RunStatus::Running,
            output: Value::Null,
            context: state.context.clone(),
            started_at,
            completed_at: None,
            error: None,
        };
        if let Err(e) = self.store().create_run(&record).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to persist run start");
        }
        self.logs.record(
            &LogEntry::new(LogLevel::Info, "flow started", tags.clone()).with_payload(json!({
                "flow_id": key.flow_id,
                "flow_name": flow.name,
                "version": key.version,
                "resumed": resumed,
                "step_count": graph.metadata.step_count,
            })),
        );

        let mut checkpoint_ids = Vec::new();
        let traversal = self
            .traverse(&graph, flow, run_id, &mut state, &cancel, &mut checkpoint_ids)
            .await;
        self.cancellation_tokens.remove(&run_id);

        let traversal = match traversal {
            Ok(traversal) => traversal,
            Err(error) => {
                self.logs.record(
                    &LogEntry::new(LogLevel::Error, "flow failed", tags)
                        .with_payload(json!({ "error": error.to_string() })),
                );
                if let Err(e) = self
                    .checkpoints
                    .save(run_id, key, &state, CheckpointStatus::Failed)
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to write final checkpoint");
                }
                self.fail_run(run_id, key, started_at, &error).await;
                return Err(error);
            }
        };

        let (status, error) = if cancel.is_cancelled() {
            (RunStatus::Error, Some("run cancelled".to_string()))
        } else if let Some(step_id) = &traversal.halted_by {
            (
                RunStatus::Error,
                Some(format!("run halted after step '{step_id}' failed")),
            )
        } else if state.errors.is_empty() {
            (RunStatus::Success, None)
        } else {
            (
                RunStatus::Partial,
                Some(format!("{} step(s) failed", state.errors.len())),
            )
        };

        self.save_checkpoint(run_id, key, &state, status.checkpoint_status(), &mut checkpoint_ids)
            .await;

        let output = flow
            .steps
            .iter()
            .rev()
            .filter_map(|s| state.result(&s.id))
            .find(|r| r.is_success())
            .map(|r| r.output.clone())
            .unwrap_or(Value::Null);
        let steps = flow
            .steps
            .iter()
            .filter_map(|s| state.result(&s.id).cloned())
            .collect();
        let duration_ms = started.elapsed().as_millis() as u64;

        let record = RunRecord {
            status,
            output: output.clone(),
            context: state.context.clone(),
            completed_at: Some(Utc::now()),
            error: error.clone(),
            ..record
        };
        if let Err(e) = self.store().complete_run(&record).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to persist run completion");
        }

        let level = match status {
            RunStatus::Success => LogLevel::Info,
            _ => LogLevel::Warn,
        };
        self.logs.record(
            &LogEntry::new(level, "flow completed", tags).with_payload(json!({
                "status": status.as_str(),
                "duration_ms": duration_ms,
                "errors": state.errors.len(),
                "error": error,
            })),
        );

        Ok(RunResult {
            run_id,
            status,
            context: state.context,
            output,
            steps,
            errors: state.errors,
            duration_ms,
            checkpoint_ids,
        })
    }

    async fn traverse(
        &self,
        graph: &CompiledGraph,
        flow: &FlowDefinition,
        run_id: Uuid,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
        checkpoint_ids: &mut Vec<Uuid>,
    ) -> Result<Traversal, RuntimeError> {
        let key = flow.key();
        let failure_policy = flow.failure_policy.unwrap_or(self.config.failure_policy);
        let semaphore = self
            .config
            .max_parallel_steps
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut ready: VecDeque<String> = graph.next_nodes(START, &Value::Null).into();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut resumed_fired: HashSet<String> = HashSet::new();
        let mut in_flight: JoinSet<(String, StepOutcome)> = JoinSet::new();
        let mut halted_by: Option<String> = None;

        loop {
            while let Some(node_id) = ready.pop_front() {
                if halted_by.is_some() || cancel.is_cancelled() {
                    ready.clear();
                    break;
                }
                if node_id == END {
                    continue;
                }

                match graph.node(&node_id) {
                    Some(GraphNode::Join(join)) => match arrive(join, state) {
                        JoinArrival::Pending => {}
                        JoinArrival::Fired => {
                            tracing::debug!(run_id = %run_id, join_id = join.id.as_str(), "join fired");
                            ready.extend(graph.next_nodes(&join.id, &Value::Null));
                        }
                        JoinArrival::AlreadyFired => {
                            // fired before the checkpoint this run resumed from
                            if resumed_fired.insert(join.id.clone()) {
                                ready.extend(graph.next_nodes(&join.id, &Value::Null));
                            }
                        }
                    },
                    Some(GraphNode::Step(step)) => {
                        if !scheduled.insert(step.id.clone()) {
                            continue;
                        }
                        if state.is_settled(&step.id) {
                            let output = state
                                .result(&step.id)
                                .map(|r| r.output.clone())
                                .unwrap_or(Value::Null);
                            tracing::debug!(run_id = %run_id, step_id = step.id.as_str(), "step already settled");
                            ready.extend(graph.next_nodes(&step.id, &output));
                            continue;
                        }

                        let executor = Arc::clone(&self.executor);
                        let policy = flow.policy.with_override(step.policy.as_ref());
                        let step = step.clone();
                        let context = state.context.clone();
                        let token = cancel.clone();
                        let semaphore = semaphore.clone();
                        in_flight.spawn(async move {
                            let _permit = match semaphore {
                                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                                None => None,
                            };
                            let outcome = executor
                                .execute(run_id, &step, policy, &context, &token)
                                .await;
                            (step.id, outcome)
                        });
                    }
                    None => {
                        tracing::warn!(run_id = %run_id, node_id = node_id.as_str(), "edge to unknown node");
                    }
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (step_id, StepOutcome { result, patch }) =
                joined.map_err(|e| RuntimeError::TaskFailed(e.to_string()))?;

            patch.apply(&mut state.context);
            if let Some(step) = flow.step(&step_id) {
                state.advance_index(step.index);
            }
            let failed = result.is_error();
            let output = result.output.clone();
            state.record(result);

            if failed && failure_policy == FailurePolicy::Halt && halted_by.is_none() {
                self.logs.record(
                    &LogEntry::new(
                        LogLevel::Warn,
                        "halting run after step failure",
                        LogTags::run(run_id).with_step(&step_id),
                    ),
                );
                halted_by = Some(step_id.clone());
            }

            if self.config.checkpoint_every_step {
                self.save_checkpoint(run_id, key, state, CheckpointStatus::Running, checkpoint_ids)
                    .await;
            }

            if halted_by.is_none() && !cancel.is_cancelled() {
                ready.extend(graph.next_nodes(&step_id, &output));
            }
        }

        Ok(Traversal { halted_by })
    }

    /// Append a checkpoint; failures are logged and never abort the run.
    async fn save_checkpoint(
        &self,
        run_id: Uuid,
        key: FlowKey,
        state: &WorkflowState,
        status: CheckpointStatus,
        checkpoint_ids: &mut Vec<Uuid>,
    ) {
        match self.checkpoints.save(run_id, key, state, status).await {
            Ok(id) => checkpoint_ids.push(id),
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "failed to write checkpoint");
            }
        }
    }

    /// Best-effort persistence of a traversal-level failure.
    async fn fail_run(
        &self,
        run_id: Uuid,
        key: FlowKey,
        started_at: DateTime<Utc>,
        error: &RuntimeError,
    ) {
        let record = RunRecord {
            run_id,
            flow_id: key.flow_id,
            flow_version: key.version,
            status: RunStatus::Error,
            output: Value::Null,
            context: Value::Null,
            started_at,
            completed_at: Some(Utc::now()),
            error: Some(error.to_string()),
        };
        let store = self.store();
        let persisted = match store.get_run(&run_id).await {
            Ok(Some(existing)) => {
                let record = RunRecord {
                    context: existing.context,
                    started_at: existing.started_at,
                    ..record
                };
                store.complete_run(&record).await
            }
            _ => match store.create_run(&record).await {
                Ok(()) => store.complete_run(&record).await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = persisted {
            tracing::warn!(run_id = %run_id, error = %e, "failed to persist run failure");
        }
    }
}

/// Run input with run metadata merged under `run`.
fn initial_context(flow: &FlowDefinition, run_id: Uuid, options: &RunOptions) -> Value {
    let mut context = WorkflowState::new(options.input.clone()).context;

    let mut run = options.metadata.clone();
    run.insert("id".to_string(), json!(run_id));
    if let Some(session) = &options.session {
        run.insert("session".to_string(), json!(session));
    }
    run.insert(
        "flow".to_string(),
        json!({
            "id": flow.id,
            "name": flow.name,
            "version": flow.version,
            "metadata": flow.metadata,
        }),
    );
    set_key(&mut context, "run", Value::Object(run));
    context
}

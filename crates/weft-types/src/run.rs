//! Run, step result, and checkpoint types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Terminal status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
}

/// Outcome of executing one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Invocation result; `null` for skipped or failed steps.
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Retries performed after the first attempt. The simplified fallback
    /// attempt is not counted here.
    #[serde(default)]
    pub retry_count: u32,
    /// Whether the simplified-payload fallback attempt produced the output.
    #[serde(default)]
    pub fallback_used: bool,
}

impl StepResult {
    pub fn success(
        step_id: impl Into<String>,
        output: Value,
        duration_ms: u64,
        retry_count: u32,
        fallback_used: bool,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Success,
            output,
            error: None,
            duration_ms,
            retry_count,
            fallback_used,
        }
    }

    pub fn error(
        step_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
        retry_count: u32,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Error,
            output: Value::Null,
            error: Some(error.into()),
            duration_ms,
            retry_count,
            fallback_used: false,
        }
    }

    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: Value::Null,
            error: None,
            duration_ms: 0,
            retry_count: 0,
            fallback_used: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == StepStatus::Error
    }
}

/// One entry of a run's ordered error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepErrorRecord {
    pub step_id: String,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run record created, traversal in progress.
    Running,
    /// Every executed step succeeded.
    Success,
    /// The run finished but at least one step failed.
    Partial,
    /// Traversal failure, halt policy, or cancellation.
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "partial" => Some(RunStatus::Partial),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }

    /// Checkpoint status recorded for the final checkpoint of a run ending in this status.
    pub fn checkpoint_status(&self) -> CheckpointStatus {
        match self {
            RunStatus::Running => CheckpointStatus::Running,
            RunStatus::Success => CheckpointStatus::Completed,
            RunStatus::Partial => CheckpointStatus::Partial,
            RunStatus::Error => CheckpointStatus::Failed,
        }
    }
}

/// Persisted run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub flow_id: Uuid,
    pub flow_version: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub context: Value,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result returned to the caller of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Final context object.
    pub context: Value,
    /// Output of the last successful step in flow order, `null` if none.
    pub output: Value,
    /// Step results ordered by flow index.
    pub steps: Vec<StepResult>,
    pub errors: Vec<StepErrorRecord>,
    pub duration_ms: u64,
    pub checkpoint_ids: Vec<Uuid>,
}

impl RunResult {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Status carried by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Running => "running",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Partial => "partial",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(CheckpointStatus::Running),
            "completed" => Some(CheckpointStatus::Completed),
            "partial" => Some(CheckpointStatus::Partial),
            "failed" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only snapshot of a run's workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub run_id: Uuid,
    pub flow_id: Uuid,
    pub flow_version: u32,
    /// The state's `current_index` at the time of the snapshot.
    pub step_index: u32,
    pub status: CheckpointStatus,
    /// Serialized workflow state.
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

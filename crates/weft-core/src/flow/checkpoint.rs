//! Append-only checkpoint manager for run state.
//!
//! Wraps a `RunStore` to persist serialized `WorkflowState` snapshots. A run
//! can be resumed from any checkpoint it produced.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use weft_types::flow::FlowKey;
use weft_types::run::{Checkpoint, CheckpointStatus};

use crate::repository::run::RunStore;

use super::state::WorkflowState;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `S: RunStore` so it works with any storage backend.
pub struct CheckpointManager<S: RunStore> {
    store: Arc<S>,
}

impl<S: RunStore> CheckpointManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Snapshot `state` and append it as a new checkpoint. Returns its ID.
    pub async fn save(
        &self,
        run_id: Uuid,
        flow: FlowKey,
        state: &WorkflowState,
        status: CheckpointStatus,
    ) -> Result<Uuid, CheckpointError> {
        let snapshot = state
            .snapshot()
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            run_id,
            flow_id: flow.flow_id,
            flow_version: flow.version,
            step_index: state.current_index,
            status,
            state: snapshot,
            created_at: Utc::now(),
        };

        self.store
            .append_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run_id,
            checkpoint_id = %checkpoint.id,
            step_index = checkpoint.step_index,
            status = status.as_str(),
            "checkpoint saved"
        );

        Ok(checkpoint.id)
    }

    pub async fn load(&self, checkpoint_id: Uuid) -> Result<Checkpoint, CheckpointError> {
        self.store
            .get_checkpoint(&checkpoint_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::NotFound(checkpoint_id))
    }

    /// Most recent checkpoint of a run, if any.
    pub async fn latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        self.store
            .latest_checkpoint(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),

    #[error("checkpoint not found: {0}")]
    NotFound(Uuid),
}

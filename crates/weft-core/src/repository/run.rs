//! Run, checkpoint, and flow store traits.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::flow::{FlowDefinition, FlowRecord, StepRecord};
use weft_types::run::{Checkpoint, RunRecord};

/// Persistence for run records and their append-only checkpoints.
pub trait RunStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a run record, or reset an existing one to `running` (resume).
    fn create_run(
        &self,
        run: &RunRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Write the terminal state of a run (status, output, context, error, completed_at).
    fn complete_run(
        &self,
        run: &RunRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Most recently appended checkpoint of a run.
    fn latest_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// All checkpoints of a run, oldest first.
    fn list_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;
}

/// Read access to stored flows and their steps.
pub trait FlowStore: Send + Sync {
    fn get_flow(
        &self,
        flow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FlowRecord>, RepositoryError>> + Send;

    /// Steps of a flow; callers must not rely on ordering.
    fn list_steps(
        &self,
        flow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;
}

/// Load a stored flow as a `FlowDefinition` (steps ordered by index).
pub async fn load_flow<F: FlowStore>(
    store: &F,
    flow_id: &Uuid,
) -> Result<FlowDefinition, RepositoryError> {
    let record = store
        .get_flow(flow_id)
        .await?
        .ok_or(RepositoryError::NotFound)?;
    let steps = store.list_steps(flow_id).await?;
    FlowDefinition::from_records(record, steps)
        .map_err(|e| RepositoryError::Serialization(format!("invalid step config: {e}")))
}

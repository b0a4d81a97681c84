//! In-memory store for tests and embedded use.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::flow::{FlowRecord, StepRecord};
use weft_types::run::{Checkpoint, RunRecord};

use super::run::{FlowStore, RunStore};

/// `RunStore` + `FlowStore` backed by concurrent maps.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<Uuid, RunRecord>,
    checkpoints: DashMap<Uuid, Checkpoint>,
    run_checkpoints: DashMap<Uuid, Vec<Uuid>>,
    flows: DashMap<Uuid, (FlowRecord, Vec<StepRecord>)>,
    fail_writes: AtomicBool,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_flow(&self, flow: FlowRecord, steps: Vec<StepRecord>) {
        self.flows.insert(flow.id, (flow, steps));
    }

    /// Make every subsequent write fail with `RepositoryError::Connection`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(RepositoryError::Connection)
        } else {
            Ok(())
        }
    }
}

impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        self.check_writable()?;
        self.runs
            .entry(run.run_id)
            .and_modify(|existing| {
                existing.status = run.status;
                existing.error = None;
                existing.completed_at = None;
            })
            .or_insert_with(|| run.clone());
        Ok(())
    }

    async fn complete_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        self.check_writable()?;
        match self.runs.get_mut(&run.run_id) {
            Some(mut existing) => {
                existing.status = run.status;
                existing.output = run.output.clone();
                existing.context = run.context.clone();
                existing.error = run.error.clone();
                existing.completed_at = run.completed_at;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.check_writable()?;
        if self.checkpoints.contains_key(&checkpoint.id) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} already exists",
                checkpoint.id
            )));
        }
        self.checkpoints.insert(checkpoint.id, checkpoint.clone());
        self.run_checkpoints
            .entry(checkpoint.run_id)
            .or_default()
            .push(checkpoint.id);
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.checkpoints.get(checkpoint_id).map(|c| c.clone()))
    }

    async fn latest_checkpoint(&self, run_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let latest = self
            .run_checkpoints
            .get(run_id)
            .and_then(|ids| ids.last().copied());
        Ok(latest.and_then(|id| self.checkpoints.get(&id).map(|c| c.clone())))
    }

    async fn list_checkpoints(&self, run_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let ids = self
            .run_checkpoints
            .get(run_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.checkpoints.get(id).map(|c| c.clone()))
            .collect())
    }
}

impl FlowStore for InMemoryRunStore {
    async fn get_flow(&self, flow_id: &Uuid) -> Result<Option<FlowRecord>, RepositoryError> {
        Ok(self.flows.get(flow_id).map(|f| f.0.clone()))
    }

    async fn list_steps(&self, flow_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        Ok(self
            .flows
            .get(flow_id)
            .map(|f| f.1.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::run::load_flow;
    use chrono::Utc;
    use serde_json::json;
    use weft_types::flow::{Policy, StepKindTag};
    use weft_types::run::{CheckpointStatus, RunStatus};

    fn run(run_id: Uuid) -> RunRecord {
        RunRecord {
            run_id,
            flow_id: Uuid::nil(),
            flow_version: 1,
            status: RunStatus::Running,
            output: json!(null),
            context: json!({}),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    fn checkpoint(run_id: Uuid, step_index: u32) -> Checkpoint {
        Checkpoint {
            id: Uuid::now_v7(),
            run_id,
            flow_id: Uuid::nil(),
            flow_version: 1,
            step_index,
            status: CheckpointStatus::Running,
            state: json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = InMemoryRunStore::new();
        let id = Uuid::now_v7();
        store.create_run(&run(id)).await.unwrap();

        let mut done = run(id);
        done.status = RunStatus::Partial;
        done.error = Some("step b failed".to_string());
        done.completed_at = Some(Utc::now());
        store.complete_run(&done).await.unwrap();

        let loaded = store.get_run(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Partial);
        assert!(loaded.completed_at.is_some());

        // resume resets the run to running
        store.create_run(&run(id)).await.unwrap();
        let loaded = store.get_run(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert!(loaded.error.is_none());
    }

    #[tokio::test]
    async fn test_checkpoints_append_only() {
        let store = InMemoryRunStore::new();
        let run_id = Uuid::now_v7();
        let first = checkpoint(run_id, 0);
        let second = checkpoint(run_id, 1);
        store.append_checkpoint(&first).await.unwrap();
        store.append_checkpoint(&second).await.unwrap();

        assert!(matches!(
            store.append_checkpoint(&first).await,
            Err(RepositoryError::Conflict(_))
        ));

        let latest = store.latest_checkpoint(&run_id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(store.list_checkpoints(&run_id).await.unwrap().len(), 2);
        assert!(store.get_checkpoint(&first.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = InMemoryRunStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.create_run(&run(Uuid::now_v7())).await,
            Err(RepositoryError::Connection)
        ));
    }

    #[tokio::test]
    async fn test_load_flow_from_records() {
        let store = InMemoryRunStore::new();
        let flow_id = Uuid::now_v7();
        store.save_flow(
            FlowRecord {
                id: flow_id,
                name: "stored".to_string(),
                version: 4,
                policy: Policy::default(),
                failure_policy: None,
                metadata: Default::default(),
            },
            vec![
                StepRecord {
                    id: "b".to_string(),
                    idx: 1,
                    kind: StepKindTag::Tool,
                    ref_id: "echo".to_string(),
                    config: json!(null),
                },
                StepRecord {
                    id: "a".to_string(),
                    idx: 0,
                    kind: StepKindTag::Agent,
                    ref_id: "writer".to_string(),
                    config: json!({ "output_mapping": { "text": "$.draft" } }),
                },
            ],
        );

        let flow = load_flow(&store, &flow_id).await.unwrap();
        assert_eq!(flow.version, 4);
        assert_eq!(flow.steps[0].id, "a");
        assert_eq!(flow.steps[0].output_mapping["text"], "$.draft");

        assert!(matches!(
            load_flow(&store, &Uuid::now_v7()).await,
            Err(RepositoryError::NotFound)
        ));
    }
}

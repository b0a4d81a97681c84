//! SQLite run, checkpoint, and flow store.
//!
//! Implements `RunStore` and `FlowStore` from `weft-core` using sqlx with split
//! read/write pools. Checkpoints are append-only; their order is the insertion
//! order (`seq`), never the timestamp.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;
use weft_core::repository::run::{FlowStore, RunStore};
use weft_types::error::RepositoryError;
use weft_types::flow::{FailurePolicy, FlowRecord, StepKindTag, StepRecord};
use weft_types::run::{Checkpoint, CheckpointStatus, RunRecord, RunStatus};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunStore` and `FlowStore`.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: DatabasePool,
}

impl SqliteRunStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a stored flow together with all of its steps.
    pub async fn save_flow(
        &self,
        flow: &FlowRecord,
        steps: &[StepRecord],
    ) -> Result<(), RepositoryError> {
        let policy = to_json(&flow.policy)?;
        let failure_policy = flow.failure_policy.map(failure_policy_str);
        let metadata = to_json(&flow.metadata)?;
        let now = format_datetime(&Utc::now());

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO flows (id, name, version, policy, failure_policy, metadata, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 version = excluded.version,
                 policy = excluded.policy,
                 failure_policy = excluded.failure_policy,
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at"#,
        )
        .bind(flow.id.to_string())
        .bind(&flow.name)
        .bind(flow.version as i64)
        .bind(&policy)
        .bind(failure_policy)
        .bind(&metadata)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        sqlx::query("DELETE FROM flow_steps WHERE flow_id = ?")
            .bind(flow.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        for step in steps {
            let config = to_json(&step.config)?;
            let result = sqlx::query(
                "INSERT INTO flow_steps (flow_id, id, idx, kind, ref_id, config) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(flow.id.to_string())
            .bind(&step.id)
            .bind(step.idx as i64)
            .bind(kind_str(step.kind))
            .bind(&step.ref_id)
            .bind(&config)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                    return Err(RepositoryError::Conflict(format!(
                        "flow {} has duplicate step '{}'",
                        flow.id, step.id
                    )));
                }
                Err(e) => return Err(query_err(e)),
            }
        }

        tx.commit()
            .await
            .map_err(query_err)?;

        tracing::debug!(flow_id = %flow.id, version = flow.version, steps = steps.len(), "flow saved");
        Ok(())
    }

    /// Runs of a flow, newest first.
    pub async fn list_runs(
        &self,
        flow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE flow_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(flow_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(query_err)?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    flow_id: String,
    flow_version: i64,
    status: String,
    output: String,
    context: String,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flow_id: row.try_get("flow_id")?,
            flow_version: row.try_get("flow_version")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            context: row.try_get("context")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_run(self) -> Result<RunRecord, RepositoryError> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| RepositoryError::Query(format!("invalid run status: {}", self.status)))?;

        Ok(RunRecord {
            run_id: parse_uuid(&self.id)?,
            flow_id: parse_uuid(&self.flow_id)?,
            flow_version: self.flow_version as u32,
            status,
            output: parse_json(&self.output, "output")?,
            context: parse_json(&self.context, "context")?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            error: self.error,
        })
    }
}

struct CheckpointRow {
    id: String,
    run_id: String,
    flow_id: String,
    flow_version: i64,
    step_index: i64,
    status: String,
    state: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            flow_id: row.try_get("flow_id")?,
            flow_version: row.try_get("flow_version")?,
            step_index: row.try_get("step_index")?,
            status: row.try_get("status")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let status = CheckpointStatus::parse(&self.status).ok_or_else(|| {
            RepositoryError::Query(format!("invalid checkpoint status: {}", self.status))
        })?;

        Ok(Checkpoint {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            flow_id: parse_uuid(&self.flow_id)?,
            flow_version: self.flow_version as u32,
            step_index: self.step_index as u32,
            status,
            state: parse_json(&self.state, "checkpoint state")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct FlowRow {
    id: String,
    name: String,
    version: i64,
    policy: String,
    failure_policy: Option<String>,
    metadata: String,
}

impl FlowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            policy: row.try_get("policy")?,
            failure_policy: row.try_get("failure_policy")?,
            metadata: row.try_get("metadata")?,
        })
    }

    fn into_record(self) -> Result<FlowRecord, RepositoryError> {
        let failure_policy = match self.failure_policy.as_deref() {
            None => None,
            Some("continue") => Some(FailurePolicy::Continue),
            Some("halt") => Some(FailurePolicy::Halt),
            Some(other) => {
                return Err(RepositoryError::Query(format!(
                    "invalid failure policy: {other}"
                )));
            }
        };

        Ok(FlowRecord {
            id: parse_uuid(&self.id)?,
            name: self.name,
            version: self.version as u32,
            policy: serde_json::from_str(&self.policy)
                .map_err(|e| RepositoryError::Query(format!("invalid policy JSON: {e}")))?,
            failure_policy,
            metadata: serde_json::from_str(&self.metadata)
                .map_err(|e| RepositoryError::Query(format!("invalid metadata JSON: {e}")))?,
        })
    }
}

struct StepRow {
    id: String,
    idx: i64,
    kind: String,
    ref_id: String,
    config: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            idx: row.try_get("idx")?,
            kind: row.try_get("kind")?,
            ref_id: row.try_get("ref_id")?,
            config: row.try_get("config")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        let kind = match self.kind.as_str() {
            "agent" => StepKindTag::Agent,
            "tool" => StepKindTag::Tool,
            other => return Err(RepositoryError::Query(format!("invalid step kind: {other}"))),
        };

        Ok(StepRecord {
            config: parse_json(&self.config, "step config")?,
            id: self.id,
            idx: self.idx as u32,
            kind,
            ref_id: self.ref_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json(s: &str, what: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

fn kind_str(kind: StepKindTag) -> &'static str {
    match kind {
        StepKindTag::Agent => "agent",
        StepKindTag::Tool => "tool",
    }
}

fn failure_policy_str(policy: FailurePolicy) -> &'static str {
    match policy {
        FailurePolicy::Continue => "continue",
        FailurePolicy::Halt => "halt",
    }
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// RunStore impl
// ---------------------------------------------------------------------------

impl RunStore for SqliteRunStore {
    async fn create_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        let output = to_json(&run.output)?;
        let context = to_json(&run.context)?;

        // A resumed run keeps its original row and start time.
        sqlx::query(
            r#"INSERT INTO runs
               (id, flow_id, flow_version, status, output, context, started_at, completed_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 completed_at = NULL,
                 error = NULL"#,
        )
        .bind(run.run_id.to_string())
        .bind(run.flow_id.to_string())
        .bind(run.flow_version as i64)
        .bind(run.status.as_str())
        .bind(&output)
        .bind(&context)
        .bind(format_datetime(&run.started_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(&run.error)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn complete_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        let output = to_json(&run.output)?;
        let context = to_json(&run.context)?;

        let result = sqlx::query(
            "UPDATE runs SET status = ?, output = ?, context = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(run.status.as_str())
        .bind(&output)
        .bind(&context)
        .bind(&run.error)
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(run.run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let state = to_json(&checkpoint.state)?;

        let result = sqlx::query(
            r#"INSERT INTO checkpoints
               (id, run_id, flow_id, flow_version, step_index, status, state, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.run_id.to_string())
        .bind(checkpoint.flow_id.to_string())
        .bind(checkpoint.flow_version as i64)
        .bind(checkpoint.step_index as i64)
        .bind(checkpoint.status.as_str())
        .bind(&state)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("checkpoint {} already exists", checkpoint.id)),
            ),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE id = ?")
            .bind(checkpoint_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn latest_checkpoint(&self, run_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE run_id = ? ORDER BY seq DESC LIMIT 1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn list_checkpoints(&self, run_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM checkpoints WHERE run_id = ? ORDER BY seq ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row).map_err(query_err)?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }
}

// ---------------------------------------------------------------------------
// FlowStore impl
// ---------------------------------------------------------------------------

impl FlowStore for SqliteRunStore {
    async fn get_flow(&self, flow_id: &Uuid) -> Result<Option<FlowRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, version, policy, failure_policy, metadata FROM flows WHERE id = ?",
        )
        .bind(flow_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = FlowRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_steps(&self, flow_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, idx, kind, ref_id, config FROM flow_steps WHERE flow_id = ?",
        )
        .bind(flow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(query_err)?;
            steps.push(r.into_record()?);
        }
        Ok(steps)
    }
}

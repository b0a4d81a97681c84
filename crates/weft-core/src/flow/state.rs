//! Mutable per-run workflow state.
//!
//! `WorkflowState` is owned by the runtime driver. Step tasks only ever see a
//! snapshot of the context; their writes come back as a `ContextPatch` that
//! the driver applies when it processes the completion.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use weft_types::run::{StepErrorRecord, StepResult, StepStatus};

use super::graph::CompiledGraph;
use super::join::JOIN_RESULTS_KEY;
use super::path::{set_key, set_path};

// ---------------------------------------------------------------------------
// Context patches
// ---------------------------------------------------------------------------

/// A single context write produced by a step.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextWrite {
    /// Write at a `$.a.b` path.
    Path { path: String, value: Value },
    /// Insert under a literal top-level key.
    Key { key: String, value: Value },
}

/// Ordered context writes produced by one step execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextPatch {
    pub writes: Vec<ContextWrite>,
}

impl ContextPatch {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn set_path(&mut self, path: impl Into<String>, value: Value) {
        self.writes.push(ContextWrite::Path {
            path: path.into(),
            value,
        });
    }

    pub fn set_key(&mut self, key: impl Into<String>, value: Value) {
        self.writes.push(ContextWrite::Key {
            key: key.into(),
            value,
        });
    }

    pub fn apply(self, context: &mut Value) {
        for write in self.writes {
            match write {
                ContextWrite::Path { path, value } => set_path(context, &path, value),
                ContextWrite::Key { key, value } => set_key(context, &key, value),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Barrier bookkeeping for one join node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierState {
    pub completed_step_ids: BTreeSet<String>,
    pub fired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// The data bus shared by all steps.
    pub context: Value,
    pub results: BTreeMap<String, StepResult>,
    #[serde(default)]
    pub errors: Vec<StepErrorRecord>,
    /// Highest flow index settled so far. Never decreases.
    #[serde(default)]
    pub current_index: u32,
    #[serde(default)]
    pub barriers: BTreeMap<String, BarrierState>,
}

impl WorkflowState {
    /// Fresh state around an initial context. Non-object contexts are wrapped
    /// under `input`.
    pub fn new(context: Value) -> Self {
        let context = match context {
            Value::Object(_) => context,
            Value::Null => Value::Object(Map::new()),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                Value::Object(map)
            }
        };
        Self {
            context,
            results: BTreeMap::new(),
            errors: Vec::new(),
            current_index: 0,
            barriers: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn restore(snapshot: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(snapshot)
    }

    pub fn advance_index(&mut self, index: u32) {
        self.current_index = self.current_index.max(index);
    }

    /// Record a settled step. Error results are also appended to the error list.
    pub fn record(&mut self, result: StepResult) {
        if let (StepStatus::Error, Some(message)) = (result.status, result.error.as_ref()) {
            self.errors.push(StepErrorRecord {
                step_id: result.step_id.clone(),
                error: message.clone(),
            });
        }
        self.results.insert(result.step_id.clone(), result);
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    /// Whether a restored step can be passed over instead of re-executed.
    pub fn is_settled(&self, step_id: &str) -> bool {
        matches!(
            self.results.get(step_id).map(|r| r.status),
            Some(StepStatus::Success | StepStatus::Skipped)
        )
    }

    /// Clear failed steps, and everything downstream of them, so a resumed
    /// traversal re-executes them.
    ///
    /// Results and error entries of cleared steps are removed. Barriers lose
    /// their cleared members, and a barrier downstream of a failure is
    /// un-fired so it aggregates the fresh results. Stale `join_results`
    /// entries are dropped. Returns the cleared step IDs.
    pub fn prepare_resume(&mut self, graph: &CompiledGraph) -> Vec<String> {
        let mut stale: BTreeSet<String> = BTreeSet::new();
        for (id, result) in &self.results {
            if result.status == StepStatus::Error {
                stale.insert(id.clone());
                stale.extend(graph.downstream(id));
            }
        }

        let cleared: Vec<String> = self
            .results
            .keys()
            .filter(|id| stale.contains(*id))
            .cloned()
            .collect();
        for id in &cleared {
            self.results.remove(id);
        }
        self.errors.retain(|e| !stale.contains(&e.step_id));

        for (join_id, barrier) in &mut self.barriers {
            barrier.completed_step_ids.retain(|id| !stale.contains(id));
            if stale.contains(join_id) {
                barrier.fired = false;
            }
        }
        if let Some(Value::Object(joined)) = self.context.get_mut(JOIN_RESULTS_KEY) {
            joined.retain(|id, _| !stale.contains(id));
        }

        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::compiler::compile;
    use crate::flow::test_support::{indexed_flow, parallel, tool_step};
    use serde_json::json;

    #[test]
    fn test_new_wraps_non_object() {
        assert_eq!(WorkflowState::new(json!("hi")).context, json!({ "input": "hi" }));
        assert_eq!(WorkflowState::new(Value::Null).context, json!({}));
        assert_eq!(
            WorkflowState::new(json!({ "topic": "rust" })).context,
            json!({ "topic": "rust" })
        );
    }

    #[test]
    fn test_record_appends_errors() {
        let mut state = WorkflowState::new(json!({}));
        state.record(StepResult::success("a", json!(1), 1, 0, false));
        state.record(StepResult::error("b", "boom", 1, 2));
        assert_eq!(state.results.len(), 2);
        assert_eq!(
            state.errors,
            vec![StepErrorRecord {
                step_id: "b".to_string(),
                error: "boom".to_string()
            }]
        );
    }

    #[test]
    fn test_current_index_monotonic() {
        let mut state = WorkflowState::new(json!({}));
        state.advance_index(3);
        state.advance_index(1);
        assert_eq!(state.current_index, 3);
    }

    #[test]
    fn test_patch_apply_order() {
        let mut ctx = json!({});
        let mut patch = ContextPatch::default();
        patch.set_path("$.report.url", json!("u1"));
        patch.set_key("export", json!({ "url": "u1" }));
        patch.set_path("$.report.url", json!("u2"));
        patch.apply(&mut ctx);
        assert_eq!(ctx["report"]["url"], json!("u2"));
        assert_eq!(ctx["export"]["url"], json!("u1"));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut state = WorkflowState::new(json!({ "x": 1 }));
        state.record(StepResult::success("a", json!("out"), 5, 1, false));
        state.advance_index(2);
        state.barriers.insert(
            "join:b+c".to_string(),
            BarrierState {
                completed_step_ids: ["b".to_string()].into_iter().collect(),
                fired: false,
            },
        );

        let restored = WorkflowState::restore(state.snapshot().unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_prepare_resume_clears_failures() {
        let graph = compile(&indexed_flow(vec![
            tool_step("a", "a"),
            parallel(tool_step("b", "b")),
            parallel(tool_step("d", "d")),
        ]))
        .unwrap();
        let mut state = WorkflowState::new(json!({}));
        state.record(StepResult::success("a", json!(1), 1, 0, false));
        state.record(StepResult::error("b", "boom", 1, 1));
        state.record(StepResult::skipped("d"));
        state.barriers.insert(
            "join:b+d".to_string(),
            BarrierState {
                completed_step_ids: ["b".to_string(), "d".to_string()].into_iter().collect(),
                fired: false,
            },
        );

        let cleared = state.prepare_resume(&graph);
        assert_eq!(cleared, vec!["b".to_string()]);
        assert!(state.errors.is_empty());
        assert!(state.result("b").is_none());
        assert!(state.is_settled("a"));
        assert!(state.is_settled("d"));
        assert!(!state.is_settled("b"));
        assert_eq!(
            state.barriers["join:b+d"].completed_step_ids,
            BTreeSet::from(["d".to_string()])
        );
    }

    #[test]
    fn test_prepare_resume_unfires_join_and_clears_downstream() {
        let graph = compile(&indexed_flow(vec![
            tool_step("a", "a"),
            parallel(tool_step("b1", "b1")),
            parallel(tool_step("b2", "b2")),
            tool_step("c", "c"),
        ]))
        .unwrap();
        let mut state = WorkflowState::new(json!({
            "join_results": {
                "b1": { "status": "success" },
                "b2": { "status": "error" }
            }
        }));
        state.record(StepResult::success("a", json!(1), 1, 0, false));
        state.record(StepResult::success("b1", json!(2), 1, 1, false));
        state.record(StepResult::error("b2", "boom", 1, 2));
        state.record(StepResult::success("c", json!(3), 1, 3, false));
        state.barriers.insert(
            "join:b1+b2".to_string(),
            BarrierState {
                completed_step_ids: ["b1".to_string(), "b2".to_string()].into_iter().collect(),
                fired: true,
            },
        );

        let cleared = state.prepare_resume(&graph);
        assert_eq!(cleared, vec!["b2".to_string(), "c".to_string()]);
        assert!(state.is_settled("a"));
        assert!(state.is_settled("b1"));
        assert!(state.result("c").is_none());

        let barrier = &state.barriers["join:b1+b2"];
        assert!(!barrier.fired);
        assert_eq!(barrier.completed_step_ids, BTreeSet::from(["b1".to_string()]));
        assert_eq!(
            state.context[JOIN_RESULTS_KEY],
            json!({ "b1": { "status": "success" } })
        );
    }

    #[test]
    fn test_prepare_resume_keeps_state_without_failures() {
        let graph = compile(&indexed_flow(vec![tool_step("a", "a"), tool_step("b", "b")])).unwrap();
        let mut state = WorkflowState::new(json!({}));
        state.record(StepResult::success("a", json!(1), 1, 0, false));
        state.record(StepResult::success("b", json!(2), 1, 1, false));
        let before = state.clone();

        assert!(state.prepare_resume(&graph).is_empty());
        assert_eq!(state, before);
    }
}

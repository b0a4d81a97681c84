//! Join barrier at parallel fan-in points.
//!
//! Every arrival from a member of the closed parallel group calls [`arrive`].
//! The barrier fires exactly once per run: the first arrival that observes a
//! recorded result for every expected member. Barrier state lives in
//! `WorkflowState`, so it is checkpointed and survives resume.

use serde_json::{Map, Value};

use super::graph::JoinNode;
use super::state::WorkflowState;

/// Context key under which fired joins publish their members' results.
pub const JOIN_RESULTS_KEY: &str = "join_results";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinArrival {
    /// Some members have not settled yet.
    Pending,
    /// This arrival completed the barrier; downstream may proceed.
    Fired,
    /// The barrier fired earlier in this run.
    AlreadyFired,
}

pub fn arrive(join: &JoinNode, state: &mut WorkflowState) -> JoinArrival {
    let barrier = state.barriers.entry(join.id.clone()).or_default();
    if barrier.fired {
        return JoinArrival::AlreadyFired;
    }

    for member in &join.expected {
        if state.results.contains_key(member) {
            barrier.completed_step_ids.insert(member.clone());
        }
    }

    if !join
        .expected
        .iter()
        .all(|m| barrier.completed_step_ids.contains(m))
    {
        tracing::trace!(
            join_id = join.id.as_str(),
            completed = barrier.completed_step_ids.len(),
            expected = join.expected.len(),
            "join pending"
        );
        return JoinArrival::Pending;
    }

    barrier.fired = true;

    let mut aggregate = Map::new();
    for member in &join.expected {
        if let Some(result) = state.results.get(member) {
            match serde_json::to_value(result) {
                Ok(value) => {
                    aggregate.insert(member.clone(), value);
                }
                Err(e) => {
                    tracing::warn!(join_id = join.id.as_str(), step_id = member.as_str(), error = %e, "could not serialize join member result");
                }
            }
        }
    }

    if !state.context.is_object() {
        state.context = Value::Object(Map::new());
    }
    if let Value::Object(ctx) = &mut state.context {
        let slot = ctx
            .entry(JOIN_RESULTS_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(existing) = slot {
            existing.extend(aggregate);
        }
    }

    tracing::debug!(join_id = join.id.as_str(), members = join.expected.len(), "join fired");
    JoinArrival::Fired
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::run::StepResult;

    fn join() -> JoinNode {
        JoinNode {
            id: "join:b1+b2".to_string(),
            expected: vec!["b1".to_string(), "b2".to_string()],
        }
    }

    #[test]
    fn test_fires_once_after_all_members() {
        let j = join();
        let mut state = WorkflowState::new(json!({}));

        state.record(StepResult::success("b1", json!({ "v": 1 }), 1, 0, false));
        assert_eq!(arrive(&j, &mut state), JoinArrival::Pending);
        assert!(!state.barriers[&j.id].fired);

        state.record(StepResult::success("b2", json!({ "v": 2 }), 1, 0, false));
        assert_eq!(arrive(&j, &mut state), JoinArrival::Fired);
        assert_eq!(arrive(&j, &mut state), JoinArrival::AlreadyFired);

        let results = &state.context[JOIN_RESULTS_KEY];
        assert_eq!(results["b1"]["output"], json!({ "v": 1 }));
        assert_eq!(results["b2"]["status"], json!("success"));
    }

    #[test]
    fn test_any_arrival_order() {
        for order in [["b1", "b2"], ["b2", "b1"]] {
            let j = join();
            let mut state = WorkflowState::new(json!({}));
            let mut fired = 0;
            for id in order {
                state.record(StepResult::success(id, json!(id), 1, 0, false));
                if arrive(&j, &mut state) == JoinArrival::Fired {
                    fired += 1;
                }
            }
            // a late duplicate arrival must not fire again
            if arrive(&j, &mut state) == JoinArrival::Fired {
                fired += 1;
            }
            assert_eq!(fired, 1, "order {order:?}");
        }
    }

    #[test]
    fn test_failed_member_still_counts() {
        let j = join();
        let mut state = WorkflowState::new(json!({}));
        state.record(StepResult::error("b1", "boom", 1, 0));
        state.record(StepResult::skipped("b2"));
        assert_eq!(arrive(&j, &mut state), JoinArrival::Fired);
        assert_eq!(state.context[JOIN_RESULTS_KEY]["b1"]["error"], json!("boom"));
    }

    #[test]
    fn test_extends_existing_join_results() {
        let j = join();
        let mut state = WorkflowState::new(json!({ "join_results": { "earlier": 1 } }));
        state.record(StepResult::success("b1", json!(1), 1, 0, false));
        state.record(StepResult::success("b2", json!(2), 1, 0, false));
        arrive(&j, &mut state);
        assert_eq!(state.context[JOIN_RESULTS_KEY]["earlier"], json!(1));
        assert!(state.context[JOIN_RESULTS_KEY].get("b2").is_some());
    }
}

//! Flow engine core: compilation, caching, and execution of flow definitions.
//!
//! - `definition` -- YAML/JSON parsing, validation, file loading
//! - `compiler` -- groups steps and builds the `CompiledGraph`
//! - `graph` -- node arena, edges, branch routing
//! - `cache` -- single-flight compiled graph cache
//! - `condition` -- comparison-only condition evaluator
//! - `path` -- `$.a.b` context path helpers
//! - `state` -- per-run `WorkflowState` and context patches
//! - `join` -- join barrier at parallel fan-in points
//! - `retry` -- retry policy, backoff, payload simplification
//! - `step_executor` -- single-step execution with retries and fallback
//! - `checkpoint` -- append-only state snapshots
//! - `log` -- structured run log sinks
//! - `runtime` -- push-based graph traversal driver

pub mod cache;
pub mod checkpoint;
pub mod compiler;
pub mod condition;
pub mod definition;
pub mod graph;
pub mod join;
pub mod log;
pub mod path;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod step_executor;

#[cfg(test)]
pub(crate) mod test_support;

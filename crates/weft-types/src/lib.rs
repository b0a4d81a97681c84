//! Shared domain types for the Weft workflow engine.
//!
//! Flow definitions, run results, checkpoints, collaborator definitions,
//! engine configuration, and structured log entries. Every type here is plain
//! data with serde support; behavior lives in `weft-core`.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod flow;
pub mod log;
pub mod run;

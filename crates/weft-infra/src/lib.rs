//! Infrastructure layer for Weft.
//!
//! Contains implementations of the ports defined in `weft-core`: SQLite run,
//! checkpoint and flow storage, the `weft.toml` config loader, and the tool
//! router that reaches builtin and HTTP tools.

pub mod config;
pub mod sqlite;
pub mod tool;

//! Flow compilation, execution, and repository trait definitions for Weft.
//!
//! This crate defines the "ports" (collaborator and repository traits) that
//! the infrastructure layer implements. It depends only on `weft-types` --
//! never on `weft-infra` or any database/IO crate.

pub mod flow;
pub mod invoke;
pub mod repository;

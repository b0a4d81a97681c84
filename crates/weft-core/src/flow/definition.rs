//! Flow definition parsing, validation, and file loading.
//!
//! Converts YAML or JSON documents into a validated `FlowDefinition`. Step
//! indices are normalized to list position so the runtime can order results
//! and checkpoints by flow position regardless of what the document declared.

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;
use weft_types::flow::FlowDefinition;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FlowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a validated `FlowDefinition`.
pub fn parse_flow_yaml(yaml: &str) -> Result<FlowDefinition, FlowError> {
    let flow: FlowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| FlowError::ParseError(e.to_string()))?;
    finish(flow)
}

/// Parse a JSON document into a validated `FlowDefinition`.
pub fn parse_flow_json(json: &str) -> Result<FlowDefinition, FlowError> {
    let flow: FlowDefinition =
        serde_json::from_str(json).map_err(|e| FlowError::ParseError(e.to_string()))?;
    finish(flow)
}

pub fn serialize_flow_yaml(flow: &FlowDefinition) -> Result<String, FlowError> {
    serde_yaml_ng::to_string(flow).map_err(|e| FlowError::ParseError(e.to_string()))
}

fn finish(mut flow: FlowDefinition) -> Result<FlowDefinition, FlowError> {
    for (position, step) in flow.steps.iter_mut().enumerate() {
        step.index = position as u32;
    }
    validate_flow(&flow)?;
    Ok(flow)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `FlowDefinition`.
///
/// Checks:
/// - Name is non-empty
/// - At least one step exists
/// - All step IDs are non-empty and unique
/// - Every step references a non-empty agent or tool ID
///
/// Branch tables are checked by the compiler.
pub fn validate_flow(flow: &FlowDefinition) -> Result<(), FlowError> {
    if flow.name.trim().is_empty() {
        return Err(FlowError::ValidationError(
            "flow name must not be empty".to_string(),
        ));
    }

    if flow.steps.is_empty() {
        return Err(FlowError::ValidationError(
            "flow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &flow.steps {
        if step.id.trim().is_empty() {
            return Err(FlowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(FlowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.kind.ref_id().trim().is_empty() {
            return Err(FlowError::ValidationError(format!(
                "step '{}' has an empty {} reference",
                step.id,
                step.kind.label()
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Load a flow from a `.json`, `.yaml` or `.yml` file.
pub fn load_flow_file(path: &Path) -> Result<FlowDefinition, FlowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_flow_json(&content),
        Some("yaml" | "yml") => parse_flow_yaml(&content),
        other => Err(FlowError::ParseError(format!(
            "unsupported flow file extension: {}",
            other.unwrap_or("<none>")
        ))),
    }
}

/// Save a flow as YAML, creating parent directories.
pub fn save_flow_file(path: &Path, flow: &FlowDefinition) -> Result<(), FlowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_flow_yaml(flow)?)?;
    Ok(())
}

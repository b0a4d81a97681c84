//! Collaborator ports: agent and tool invocation.
//!
//! The execution core never talks to a model or a tool backend directly. It
//! resolves a step's reference through the [`registry::Registry`] and hands a
//! request to an [`AgentInvoker`] or [`ToolInvoker`]. Implementations live in
//! `weft-infra` (HTTP tools) or right here for in-process builtins.
//!
//! Both traits use RPITIT (Rust 2024 edition); [`boxed`] provides the
//! object-safe wrappers used for runtime selection.

pub mod boxed;
pub mod builtin;
pub mod registry;

use serde_json::{Map, Value};
use thiserror::Error;
use weft_types::agent::{AgentDefinition, ToolDefinition};

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// Prompt-in request to an agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub agent: AgentDefinition,
    pub system_prompt: String,
    pub user_message: String,
    /// Resolved step inputs.
    pub inputs: Map<String, Value>,
    /// Snapshot of the run context.
    pub context: Value,
}

/// What an agent returned.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentResponse {
    Text(String),
    Structured(Value),
}

impl AgentResponse {
    /// Normalize into the JSON value recorded as the step output. Text is
    /// wrapped as `{"text": ...}`.
    pub fn into_output(self) -> Value {
        match self {
            AgentResponse::Text(text) => {
                let mut map = Map::new();
                map.insert("text".to_string(), Value::String(text));
                Value::Object(map)
            }
            AgentResponse::Structured(value) => value,
        }
    }
}

/// Call to a tool.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub tool: ToolDefinition,
    pub inputs: Map<String, Value>,
    /// Set on the reduced-payload fallback attempt.
    pub simplified: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationError {
    /// The collaborator reported a failure.
    #[error("invocation failed: {0}")]
    Failed(String),

    /// The attempt deadline expired.
    #[error("invocation timed out after {0}ms")]
    Timeout(u64),

    /// The run was cancelled while the attempt was in flight.
    #[error("invocation cancelled")]
    Cancelled,
}

impl InvocationError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InvocationError::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Agent collaborator.
pub trait AgentInvoker: Send + Sync {
    fn invoke(
        &self,
        request: AgentRequest,
    ) -> impl std::future::Future<Output = Result<AgentResponse, InvocationError>> + Send;
}

/// Tool collaborator.
pub trait ToolInvoker: Send + Sync {
    fn invoke(
        &self,
        request: ToolRequest,
    ) -> impl std::future::Future<Output = Result<Value, InvocationError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_response_into_output() {
        assert_eq!(
            AgentResponse::Text("hi".to_string()).into_output(),
            json!({ "text": "hi" })
        );
        assert_eq!(
            AgentResponse::Structured(json!({ "score": 1 })).into_output(),
            json!({ "score": 1 })
        );
    }

    #[test]
    fn test_invocation_error_retryable() {
        assert!(InvocationError::Failed("x".to_string()).is_retryable());
        assert!(InvocationError::Timeout(10).is_retryable());
        assert!(!InvocationError::Cancelled.is_retryable());
        assert!(InvocationError::Timeout(250).to_string().contains("250ms"));
    }
}

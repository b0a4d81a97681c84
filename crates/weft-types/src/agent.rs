//! Collaborator definitions resolved through the registry.
//!
//! An `AgentDefinition` describes a prompt-driven agent; a `ToolDefinition`
//! describes a callable tool and how it is reached.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    /// System prompt sent with every invocation.
    #[serde(default)]
    pub system_prompt: String,
    /// Optional `{{ key }}` template rendered from the step's inputs into the
    /// user message. Without it the inputs are sent as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transport: ToolTransport,
}

/// How a tool is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolTransport {
    /// In-process function, looked up by name.
    Builtin { function: String },
    /// JSON over HTTP. Inputs become the request body (or query for GET).
    Http {
        #[serde(default = "default_http_method")]
        method: String,
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// Tool hosted by an external tool-protocol server.
    External { server: String, tool: String },
}

fn default_http_method() -> String {
    "POST".to_string()
}

impl ToolTransport {
    pub fn label(&self) -> &'static str {
        match self {
            ToolTransport::Builtin { .. } => "builtin",
            ToolTransport::Http { .. } => "http",
            ToolTransport::External { .. } => "external",
        }
    }
}

//! In-process builtin tools.
//!
//! - `echo`: returns the inputs unchanged
//! - `merge`: shallow-merges every object-valued input into one object
//! - `collect`: returns the input values as an array, ordered by key

use serde_json::{Map, Value};
use weft_types::agent::ToolTransport;

use super::{InvocationError, ToolInvoker, ToolRequest};

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinToolInvoker;

impl BuiltinToolInvoker {
    pub fn call(function: &str, inputs: Map<String, Value>) -> Result<Value, InvocationError> {
        match function {
            "echo" => Ok(Value::Object(inputs)),
            "merge" => {
                let mut merged = Map::new();
                for (_, value) in inputs {
                    if let Value::Object(entries) = value {
                        merged.extend(entries);
                    }
                }
                Ok(Value::Object(merged))
            }
            "collect" => {
                let mut entries: Vec<(String, Value)> = inputs.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(Value::Array(entries.into_iter().map(|(_, v)| v).collect()))
            }
            other => Err(InvocationError::Failed(format!(
                "unknown builtin function '{other}'"
            ))),
        }
    }
}

impl ToolInvoker for BuiltinToolInvoker {
    async fn invoke(&self, request: ToolRequest) -> Result<Value, InvocationError> {
        match &request.tool.transport {
            ToolTransport::Builtin { function } => Self::call(function, request.inputs),
            other => Err(InvocationError::Failed(format!(
                "tool '{}' uses {} transport, not builtin",
                request.tool.id,
                other.label()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::agent::ToolDefinition;

    fn inputs(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn test_echo() {
        let out = BuiltinToolInvoker::call("echo", inputs(json!({ "a": 1 }))).unwrap();
        assert_eq!(out, json!({ "a": 1 }));
    }

    #[test]
    fn test_merge() {
        let out = BuiltinToolInvoker::call(
            "merge",
            inputs(json!({ "x": { "a": 1 }, "y": { "b": 2 }, "z": "ignored" })),
        )
        .unwrap();
        assert_eq!(out, json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn test_collect_sorted_by_key() {
        let out =
            BuiltinToolInvoker::call("collect", inputs(json!({ "b": 2, "a": 1 }))).unwrap();
        assert_eq!(out, json!([1, 2]));
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            BuiltinToolInvoker::call("nope", Map::new()),
            Err(InvocationError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_non_builtin_transport() {
        let request = ToolRequest {
            tool: ToolDefinition {
                id: "remote".to_string(),
                name: "Remote".to_string(),
                description: None,
                transport: ToolTransport::External {
                    server: "mcp-local".to_string(),
                    tool: "search".to_string(),
                },
            },
            inputs: Map::new(),
            simplified: false,
        };
        let err = BuiltinToolInvoker.invoke(request).await.unwrap_err();
        assert!(err.to_string().contains("external"));
    }
}

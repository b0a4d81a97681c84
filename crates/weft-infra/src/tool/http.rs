//! JSON-over-HTTP tool transport.
//!
//! Inputs become the JSON request body, or query parameters for `GET` and
//! `DELETE`. A JSON response body is the step output; anything else is wrapped
//! as `{"status": .., "body": ..}`. Non-2xx responses are invocation failures
//! and therefore retried by the step executor.

use std::collections::HashMap;

use reqwest::{Method, Url};
use serde_json::{Map, Value, json};
use weft_core::invoke::{InvocationError, ToolInvoker, ToolRequest};
use weft_types::agent::ToolTransport;

/// Longest slice of an error response body quoted in the failure message.
const ERROR_BODY_LIMIT: usize = 512;

/// A fully resolved HTTP call, built before anything touches the network.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpCall {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Resolve method, URL, headers and payload for a tool call.
pub fn build_request(
    method: &str,
    url: &str,
    headers: &HashMap<String, String>,
    inputs: Map<String, Value>,
) -> Result<HttpCall, InvocationError> {
    let method: Method = method
        .to_ascii_uppercase()
        .parse()
        .map_err(|_| InvocationError::Failed(format!("invalid HTTP method: {method}")))?;
    let mut url = Url::parse(url)
        .map_err(|e| InvocationError::Failed(format!("invalid tool URL '{url}': {e}")))?;

    let mut headers: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.sort();

    let body = if method == Method::GET || method == Method::DELETE {
        if !inputs.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &inputs {
                match value {
                    Value::String(s) => pairs.append_pair(key, s),
                    other => pairs.append_pair(key, &other.to_string()),
                };
            }
        }
        None
    } else {
        Some(Value::Object(inputs))
    };

    Ok(HttpCall {
        method,
        url,
        headers,
        body,
    })
}

/// Tool invoker for `ToolTransport::Http` definitions.
#[derive(Clone, Default)]
pub struct HttpToolInvoker {
    client: reqwest::Client,
}

impl HttpToolInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, tool_id: &str, call: HttpCall) -> Result<Value, InvocationError> {
        let mut request = self.client.request(call.method.clone(), call.url.clone());
        for (key, value) in &call.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            InvocationError::Failed(format!("HTTP request to '{}' failed: {e}", call.url))
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            InvocationError::Failed(format!("failed to read HTTP response body: {e}"))
        })?;

        tracing::debug!(
            tool = tool_id,
            method = %call.method,
            url = %call.url,
            status = status.as_u16(),
            body_len = text.len(),
            "HTTP tool call completed"
        );

        if !status.is_success() {
            let excerpt: String = text.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(InvocationError::Failed(format!(
                "HTTP {} from '{}': {excerpt}",
                status.as_u16(),
                call.url
            )));
        }

        Ok(serde_json::from_str(&text)
            .unwrap_or_else(|_| json!({ "status": status.as_u16(), "body": text })))
    }
}

impl ToolInvoker for HttpToolInvoker {
    async fn invoke(&self, request: ToolRequest) -> Result<Value, InvocationError> {
        match &request.tool.transport {
            ToolTransport::Http {
                method,
                url,
                headers,
            } => {
                let call = build_request(method, url, headers, request.inputs)?;
                self.send(&request.tool.id, call).await
            }
            other => Err(InvocationError::Failed(format!(
                "tool '{}' uses {} transport, not http",
                request.tool.id,
                other.label()
            ))),
        }
    }
}

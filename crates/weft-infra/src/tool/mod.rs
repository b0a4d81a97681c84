//! Tool routing by transport.
//!
//! `ToolRouter` is the `ToolInvoker` handed to the step executor in
//! production. Builtins run in-process, HTTP tools go through
//! [`http::HttpToolInvoker`], and external-protocol tools are forwarded to the
//! invoker registered for their server.

pub mod http;

use std::collections::HashMap;

use serde_json::Value;
use weft_core::invoke::boxed::BoxToolInvoker;
use weft_core::invoke::builtin::BuiltinToolInvoker;
use weft_core::invoke::{InvocationError, ToolInvoker, ToolRequest};
use weft_types::agent::ToolTransport;

use self::http::HttpToolInvoker;

#[derive(Default)]
pub struct ToolRouter {
    http: HttpToolInvoker,
    /// External tool-protocol servers keyed by server name.
    servers: HashMap<String, BoxToolInvoker>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http(mut self, http: HttpToolInvoker) -> Self {
        self.http = http;
        self
    }

    /// Route `ToolTransport::External { server, .. }` calls for `server` to `invoker`.
    pub fn with_server(mut self, server: impl Into<String>, invoker: BoxToolInvoker) -> Self {
        self.servers.insert(server.into(), invoker);
        self
    }
}

impl ToolInvoker for ToolRouter {
    async fn invoke(&self, request: ToolRequest) -> Result<Value, InvocationError> {
        match request.tool.transport.clone() {
            ToolTransport::Builtin { function } => {
                BuiltinToolInvoker::call(&function, request.inputs)
            }
            ToolTransport::Http { .. } => self.http.invoke(request).await,
            ToolTransport::External { server, tool } => match self.servers.get(&server) {
                Some(invoker) => invoker.invoke(request).await,
                None => {
                    tracing::warn!(server = server.as_str(), tool = tool.as_str(), "no invoker for tool server");
                    Err(InvocationError::Failed(format!(
                        "tool server '{server}' is not connected (tool '{tool}')"
                    )))
                }
            },
        }
    }
}

//! Object-safe dynamic dispatch wrappers for the invoker traits.
//!
//! Same blanket-impl pattern for both collaborators:
//! 1. An object-safe `*Dyn` trait with boxed futures
//! 2. Blanket impl of the `*Dyn` trait for every `T` implementing the RPITIT trait
//! 3. A `Box*` newtype wrapping `Box<dyn *Dyn>` that delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::{AgentInvoker, AgentRequest, AgentResponse, InvocationError, ToolInvoker, ToolRequest};

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Object-safe version of [`AgentInvoker`].
pub trait AgentInvokerDyn: Send + Sync {
    fn invoke_boxed(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, InvocationError>> + Send + '_>>;
}

impl<T: AgentInvoker> AgentInvokerDyn for T {
    fn invoke_boxed(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, InvocationError>> + Send + '_>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased agent collaborator.
pub struct BoxAgentInvoker {
    inner: Box<dyn AgentInvokerDyn + Send + Sync>,
}

impl BoxAgentInvoker {
    pub fn new<T: AgentInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }

    pub async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, InvocationError> {
        self.inner.invoke_boxed(request).await
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Object-safe version of [`ToolInvoker`].
pub trait ToolInvokerDyn: Send + Sync {
    fn invoke_boxed(
        &self,
        request: ToolRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, InvocationError>> + Send + '_>>;
}

impl<T: ToolInvoker> ToolInvokerDyn for T {
    fn invoke_boxed(
        &self,
        request: ToolRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, InvocationError>> + Send + '_>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased tool collaborator.
pub struct BoxToolInvoker {
    inner: Box<dyn ToolInvokerDyn + Send + Sync>,
}

impl BoxToolInvoker {
    pub fn new<T: ToolInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }

    pub async fn invoke(&self, request: ToolRequest) -> Result<Value, InvocationError> {
        self.inner.invoke_boxed(request).await
    }
}

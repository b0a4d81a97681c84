//! Scripted collaborators shared by the executor and runtime tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use weft_types::agent::{AgentDefinition, ToolDefinition, ToolTransport};
use weft_types::config::EngineConfig;
use weft_types::flow::{ExecutionMode, FlowDefinition, Policy, StepKind, StepNode};

use crate::invoke::boxed::{BoxAgentInvoker, BoxToolInvoker};
use crate::invoke::registry::Registry;
use crate::invoke::{AgentInvoker, AgentRequest, AgentResponse, InvocationError, ToolInvoker, ToolRequest};

use super::step_executor::StepExecutor;

#[derive(Debug, Clone)]
pub struct Call {
    pub id: String,
    pub simplified: bool,
    pub inputs: Map<String, Value>,
}

#[derive(Default)]
struct ScriptState {
    calls: Vec<Call>,
    failures: HashMap<String, u32>,
    replies: HashMap<String, Value>,
    delays: HashMap<String, Duration>,
    active: usize,
    peak: usize,
}

/// Shared script driving both scripted collaborators. Keyed by agent/tool id.
#[derive(Clone, Default)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `times` calls to `id`.
    pub fn fail(&self, id: &str, times: u32) {
        self.state.lock().unwrap().failures.insert(id.to_string(), times);
    }

    pub fn reply(&self, id: &str, output: Value) {
        self.state.lock().unwrap().replies.insert(id.to_string(), output);
    }

    pub fn delay(&self, id: &str, delay: Duration) {
        self.state.lock().unwrap().delays.insert(id.to_string(), delay);
    }

    pub fn calls(&self, id: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| c.id == id).count()
    }

    pub fn simplified_calls(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.id == id && c.simplified)
            .count()
    }

    /// IDs in invocation order.
    pub fn call_order(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.iter().map(|c| c.id.clone()).collect()
    }

    /// Highest number of invocations observed in flight at once.
    pub fn peak(&self) -> usize {
        self.state.lock().unwrap().peak
    }

    pub fn last_inputs(&self, id: &str) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .rev()
            .find(|c| c.id == id)
            .map(|c| c.inputs.clone())
    }

    /// Executor over scripted collaborators with a 1ms backoff unit.
    pub fn executor(&self, agents: &[&str], tools: &[&str]) -> StepExecutor {
        let registry = Registry::from_definitions(
            agents.iter().map(|id| agent_def(id)),
            tools.iter().map(|id| tool_def(id)),
        );
        let config = EngineConfig {
            backoff_base_ms: 1,
            ..EngineConfig::default()
        };
        StepExecutor::new(
            registry,
            BoxAgentInvoker::new(ScriptedAgent(self.clone())),
            BoxToolInvoker::new(ScriptedTool(self.clone())),
            &config,
        )
    }

    async fn respond(
        &self,
        id: &str,
        simplified: bool,
        inputs: Map<String, Value>,
    ) -> Result<Value, InvocationError> {
        let (count, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call {
                id: id.to_string(),
                simplified,
                inputs: inputs.clone(),
            });
            let count = state.calls.iter().filter(|c| c.id == id).count() as u32;
            state.active += 1;
            state.peak = state.peak.max(state.active);
            (count, state.delays.get(id).copied())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.active -= 1;
        if count <= state.failures.get(id).copied().unwrap_or(0) {
            return Err(InvocationError::Failed(format!("{id} failed on call {count}")));
        }
        Ok(state
            .replies
            .get(id)
            .cloned()
            .unwrap_or_else(|| json!({ "from": id, "inputs": inputs })))
    }
}

pub struct ScriptedAgent(pub Script);

impl AgentInvoker for ScriptedAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, InvocationError> {
        self.0
            .respond(&request.agent.id, false, request.inputs)
            .await
            .map(AgentResponse::Structured)
    }
}

pub struct ScriptedTool(pub Script);

impl ToolInvoker for ScriptedTool {
    async fn invoke(&self, request: ToolRequest) -> Result<Value, InvocationError> {
        self.0
            .respond(&request.tool.id, request.simplified, request.inputs)
            .await
    }
}

pub fn agent_def(id: &str) -> AgentDefinition {
    AgentDefinition {
        id: id.to_string(),
        name: id.to_string(),
        system_prompt: String::new(),
        prompt_template: None,
        model: None,
    }
}

pub fn tool_def(id: &str) -> ToolDefinition {
    ToolDefinition {
        id: id.to_string(),
        name: id.to_string(),
        description: None,
        transport: ToolTransport::Builtin {
            function: "echo".to_string(),
        },
    }
}

fn step(id: &str, kind: StepKind) -> StepNode {
    StepNode {
        id: id.to_string(),
        name: None,
        index: 0,
        kind,
        args: Map::new(),
        input_mapping: Default::default(),
        output_mapping: Default::default(),
        condition: None,
        execution_mode: None,
        policy: None,
        branches: Vec::new(),
    }
}

pub fn agent_step(id: &str, agent_id: &str) -> StepNode {
    step(
        id,
        StepKind::Agent {
            agent_id: agent_id.to_string(),
        },
    )
}

pub fn tool_step(id: &str, tool_id: &str) -> StepNode {
    step(
        id,
        StepKind::Tool {
            tool_id: tool_id.to_string(),
        },
    )
}

pub fn parallel(mut step: StepNode) -> StepNode {
    step.execution_mode = Some(ExecutionMode::Parallel);
    step
}

/// Wrap steps into a flow, numbering them in order.
pub fn indexed_flow(steps: Vec<StepNode>) -> FlowDefinition {
    let steps = steps
        .into_iter()
        .enumerate()
        .map(|(i, mut s)| {
            s.index = i as u32;
            s
        })
        .collect();
    FlowDefinition {
        id: uuid::Uuid::nil(),
        name: "test".to_string(),
        version: 1,
        policy: Policy::default(),
        failure_policy: None,
        steps,
        metadata: HashMap::new(),
    }
}

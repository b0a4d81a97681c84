//! Read-only lookup of agent and tool definitions by reference ID.

use std::collections::HashMap;

use weft_types::agent::{AgentDefinition, ToolDefinition};

/// Registry injected into the step executor. Built once, never mutated
/// during a run.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    agents: HashMap<String, AgentDefinition>,
    tools: HashMap<String, ToolDefinition>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(
        agents: impl IntoIterator<Item = AgentDefinition>,
        tools: impl IntoIterator<Item = ToolDefinition>,
    ) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
            tools: tools.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.insert(agent.id.clone(), agent);
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.insert(tool.id.clone(), tool);
        self
    }

    pub fn agent(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.get(id)
    }

    pub fn tool(&self, id: &str) -> Option<&ToolDefinition> {
        self.tools.get(id)
    }
}

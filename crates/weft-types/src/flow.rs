//! Flow definition types.
//!
//! A `FlowDefinition` is the canonical, fully-resolved description of a flow:
//! an ordered list of `StepNode`s plus default execution policy. It is
//! immutable for the lifetime of a run and is the input to graph compilation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// The canonical flow definition handed to the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Stable flow identity.
    pub id: Uuid,
    /// Human-readable flow name.
    pub name: String,
    /// Revision of the flow. Bumped whenever the step list changes; part of
    /// the compiled-graph cache key.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Default execution policy for every step.
    #[serde(default)]
    pub policy: Policy,
    /// What happens after a step fails terminally (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    /// Ordered steps.
    pub steps: Vec<StepNode>,
    /// Extensible metadata, copied into the run context under `run.flow`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> u32 {
    1
}

impl FlowDefinition {
    /// Cache key identifying this exact revision of the flow.
    pub fn key(&self) -> FlowKey {
        FlowKey {
            flow_id: self.id,
            version: self.version,
        }
    }

    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&StepNode> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Build a flow from the records held by a flow store.
    ///
    /// Step records are ordered by `idx` before conversion.
    pub fn from_records(
        record: FlowRecord,
        mut steps: Vec<StepRecord>,
    ) -> Result<Self, serde_json::Error> {
        steps.sort_by_key(|r| r.idx);
        let steps = steps
            .into_iter()
            .map(StepRecord::into_step_node)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: record.id,
            name: record.name,
            version: record.version,
            policy: record.policy,
            failure_policy: record.failure_policy,
            steps,
            metadata: record.metadata,
        })
    }
}

/// Identity of a compiled flow revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub flow_id: Uuid,
    pub version: u32,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.flow_id, self.version)
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Flow-level execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Deadline for a single invocation attempt, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    2
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Policy {
    /// Apply a per-step override on top of this policy.
    pub fn with_override(&self, step: Option<&StepPolicy>) -> Policy {
        match step {
            Some(o) => Policy {
                timeout_ms: o.timeout_ms.unwrap_or(self.timeout_ms),
                max_retries: o.max_retries.unwrap_or(self.max_retries),
            },
            None => *self,
        }
    }
}

/// Per-step policy override. Unset fields inherit the flow default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Behavior after a step fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the error and keep executing downstream steps.
    #[default]
    Continue,
    /// Stop scheduling new steps; the run ends with status `error`.
    Halt,
}

/// Execution-mode hint for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

// ---------------------------------------------------------------------------
// Step Node
// ---------------------------------------------------------------------------

/// What a step invokes.
///
/// Internally tagged by `type`:
/// ```yaml
/// kind:
///   type: tool
///   tool_id: notion-export
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a registered agent.
    Agent { agent_id: String },
    /// Invoke a registered tool.
    Tool { tool_id: String },
}

impl StepKind {
    /// The registry reference this step resolves through.
    pub fn ref_id(&self) -> &str {
        match self {
            StepKind::Agent { agent_id } => agent_id,
            StepKind::Tool { tool_id } => tool_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Agent { .. } => "agent",
            StepKind::Tool { .. } => "tool",
        }
    }
}

/// A single step of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepNode {
    /// Unique within the flow.
    pub id: String,
    /// Context key under which the whole invocation result is merged.
    /// Defaults to the step ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Position in the flow's step list.
    #[serde(default)]
    pub index: u32,
    pub kind: StepKind,
    /// Static arguments passed to every invocation, underneath mapped inputs.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    /// local-name -> `"$.context.path"` or a literal value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, Value>,
    /// output-field -> context path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,
    /// `$.field <op> value`; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<StepPolicy>,
    /// Conditional routing table. A non-empty table makes this step a branch point.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchRule>,
}

impl StepNode {
    /// Name used as the context key for this step's merged result.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn is_parallel(&self) -> bool {
        self.execution_mode == Some(ExecutionMode::Parallel)
    }

    pub fn is_conditional(&self) -> bool {
        !self.branches.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Branch table
// ---------------------------------------------------------------------------

/// One row of a conditional step's routing table.
///
/// Exactly one of `when`, `equals`, `contains` must be set.
/// ```yaml
/// branches:
///   - equals: notion
///     target: export_step
///   - contains: urgent
///     target: escalate
///   - when: "$.score >= 0.8"
///     target: publish
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRule {
    /// Comparison expression evaluated against the step's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Exact match against the routing value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    /// Substring / membership match against the routing value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    /// Step ID to route to when the predicate matches.
    pub target: String,
}

/// The single predicate of a well-formed `BranchRule`.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchPredicate {
    When(String),
    Equals(Value),
    Contains(String),
}

impl BranchRule {
    /// Extract the rule's predicate, rejecting rules with zero or several.
    pub fn predicate(&self) -> Result<BranchPredicate, &'static str> {
        let set = [
            self.when.is_some(),
            self.equals.is_some(),
            self.contains.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();

        if set == 0 {
            return Err("rule has no predicate (expected one of when/equals/contains)");
        }
        if set > 1 {
            return Err("rule has more than one predicate");
        }

        if let Some(expr) = &self.when {
            Ok(BranchPredicate::When(expr.clone()))
        } else if let Some(value) = &self.equals {
            Ok(BranchPredicate::Equals(value.clone()))
        } else if let Some(needle) = &self.contains {
            Ok(BranchPredicate::Contains(needle.clone()))
        } else {
            Err("rule has no predicate (expected one of when/equals/contains)")
        }
    }
}

// ---------------------------------------------------------------------------
// Store record shape
// ---------------------------------------------------------------------------

/// Flow header as persisted by the flow store (steps are stored separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Step kind tag as stored by the flow store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKindTag {
    Agent,
    Tool,
}

/// A step as persisted by the flow/step store: `{id, idx, kind, ref_id, config}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub idx: u32,
    pub kind: StepKindTag,
    pub ref_id: String,
    /// Everything else about the step (mappings, condition, mode, policy, branches).
    #[serde(default)]
    pub config: Value,
}

/// Shape of `StepRecord.config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepRecordConfig {
    pub name: Option<String>,
    pub args: Map<String, Value>,
    pub input_mapping: BTreeMap<String, Value>,
    pub output_mapping: BTreeMap<String, String>,
    pub condition: Option<String>,
    pub execution_mode: Option<ExecutionMode>,
    pub policy: Option<StepPolicy>,
    pub branches: Vec<BranchRule>,
}

impl StepRecord {
    /// Convert a stored record into a `StepNode`.
    pub fn into_step_node(self) -> Result<StepNode, serde_json::Error> {
        let config: StepRecordConfig = if self.config.is_null() {
            StepRecordConfig::default()
        } else {
            serde_json::from_value(self.config)?
        };

        let kind = match self.kind {
            StepKindTag::Agent => StepKind::Agent {
                agent_id: self.ref_id,
            },
            StepKindTag::Tool => StepKind::Tool {
                tool_id: self.ref_id,
            },
        };

        Ok(StepNode {
            id: self.id,
            name: config.name,
            index: self.idx,
            kind,
            args: config.args,
            input_mapping: config.input_mapping,
            output_mapping: config.output_mapping,
            condition: config.condition,
            execution_mode: config.execution_mode,
            policy: config.policy,
            branches: config.branches,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

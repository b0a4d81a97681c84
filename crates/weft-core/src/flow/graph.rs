//! Compiled execution graph.
//!
//! Nodes live in an arena keyed by string ID; edges are an explicit list with
//! an outgoing index. Two virtual markers, `__start__` and `__end__`, bound
//! the graph and never appear in the arena.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::Serialize;
use serde_json::{Map, Value};
use weft_types::flow::{BranchPredicate, FlowKey, StepNode};

use super::condition::Condition;

/// Entry marker.
pub const START: &str = "__start__";
/// Exit marker.
pub const END: &str = "__end__";

/// Derive the join ID for a parallel group: `join:<id1>+<id2>...`.
pub fn join_id(members: &[String]) -> String {
    format!("join:{}", members.join("+"))
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Fan-in point closing a parallel group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinNode {
    pub id: String,
    /// IDs of the parallel group this join closes.
    pub expected: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum GraphNode {
    Step(StepNode),
    Join(JoinNode),
}

impl GraphNode {
    pub fn id(&self) -> &str {
        match self {
            GraphNode::Step(step) => &step.id,
            GraphNode::Join(join) => &join.id,
        }
    }
}

// ---------------------------------------------------------------------------
// Edges and routing
// ---------------------------------------------------------------------------

/// A compiled branch-table row.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub matcher: RouteMatcher,
    pub target: String,
}

#[derive(Debug, Clone)]
pub enum RouteMatcher {
    /// Condition evaluated against the step output object.
    When(Condition),
    Equals(Value),
    Contains(String),
}

impl RouteMatcher {
    pub fn from_predicate(predicate: BranchPredicate) -> Result<Self, String> {
        match predicate {
            BranchPredicate::When(expr) => Condition::parse(&expr)
                .map(RouteMatcher::When)
                .map_err(|e| e.to_string()),
            BranchPredicate::Equals(v) => Ok(RouteMatcher::Equals(v)),
            BranchPredicate::Contains(s) => Ok(RouteMatcher::Contains(s)),
        }
    }

    fn matches(&self, output: &Value) -> bool {
        match self {
            RouteMatcher::When(condition) => condition.evaluate(&output_scope(output)),
            RouteMatcher::Equals(expected) => routing_value(output) == expected,
            RouteMatcher::Contains(needle) => match routing_value(output) {
                Value::String(s) => s.contains(needle.as_str()),
                Value::Array(items) => items.iter().any(|v| v.as_str() == Some(needle.as_str())),
                Value::Object(map) => map.contains_key(needle),
                _ => false,
            },
        }
    }
}

/// Router attached to a conditional step.
#[derive(Debug, Clone)]
pub struct BranchRouter {
    pub rules: Vec<RouteRule>,
}

impl BranchRouter {
    /// Candidate targets in listed order.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.target.as_str())
    }

    /// Pick the target for a recorded step output: the first matching rule,
    /// or the first listed target when nothing matches.
    pub fn route(&self, output: &Value) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.matcher.matches(output))
            .or_else(|| self.rules.first())
            .map(|r| r.target.as_str())
    }
}

/// The value a branch table inspects: a string output as-is, the `result`,
/// `text` or `output` field of an object, or the whole output otherwise.
pub fn routing_value(output: &Value) -> &Value {
    if let Value::Object(map) = output {
        for key in ["result", "text", "output"] {
            if let Some(v) = map.get(key) {
                return v;
            }
        }
    }
    output
}

fn output_scope(output: &Value) -> Value {
    match output {
        Value::Object(_) => output.clone(),
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other.clone());
            Value::Object(map)
        }
    }
}

#[derive(Debug, Clone)]
pub enum Edge {
    Direct { from: String, to: String },
    Conditional { from: String, router: BranchRouter },
}

impl Edge {
    pub fn source(&self) -> &str {
        match self {
            Edge::Direct { from, .. } | Edge::Conditional { from, .. } => from,
        }
    }
}

// ---------------------------------------------------------------------------
// CompiledGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphMetadata {
    pub step_count: usize,
    pub has_parallel: bool,
    pub has_conditional: bool,
    pub join_nodes: Vec<String>,
}

/// Executable form of a flow revision. Immutable once built.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub key: FlowKey,
    pub nodes: HashMap<String, GraphNode>,
    pub edges: Vec<Edge>,
    pub outgoing: HashMap<String, Vec<usize>>,
    pub metadata: GraphMetadata,
}

impl CompiledGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|i| self.edges.get(*i))
    }

    /// Successors of `id` given the node's recorded output (used only by
    /// conditional edges).
    pub fn next_nodes(&self, id: &str, output: &Value) -> Vec<String> {
        let mut next = Vec::new();
        for edge in self.outgoing(id) {
            match edge {
                Edge::Direct { to, .. } => next.push(to.clone()),
                Edge::Conditional { router, .. } => {
                    if let Some(target) = router.route(output) {
                        next.push(target.to_string());
                    }
                }
            }
        }
        next
    }

    /// Every node reachable from `id`, following all edges and every branch
    /// candidate. `id` itself and the markers are excluded.
    pub fn downstream(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for edge in self.outgoing(&current) {
                let targets: Vec<&str> = match edge {
                    Edge::Direct { to, .. } => vec![to.as_str()],
                    Edge::Conditional { router, .. } => router.candidates().collect(),
                };
                for target in targets {
                    if target != END && target != id && seen.insert(target.to_string()) {
                        queue.push_back(target.to_string());
                    }
                }
            }
        }
        seen
    }

    /// Whether there is a direct edge `from -> to`.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.outgoing(from)
            .any(|e| matches!(e, Edge::Direct { to: t, .. } if t == to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> BranchRouter {
        BranchRouter {
            rules: vec![
                RouteRule {
                    matcher: RouteMatcher::Contains("urgent".to_string()),
                    target: "escalate".to_string(),
                },
                RouteRule {
                    matcher: RouteMatcher::Equals(json!("notion")),
                    target: "export_step".to_string(),
                },
                RouteRule {
                    matcher: RouteMatcher::When(Condition::parse("$.score >= 0.8").unwrap()),
                    target: "publish".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_route_equals_on_string_output() {
        assert_eq!(router().route(&json!("notion")), Some("export_step"));
    }

    #[test]
    fn test_route_reads_text_field() {
        assert_eq!(
            router().route(&json!({ "text": "notion" })),
            Some("export_step")
        );
    }

    #[test]
    fn test_route_contains() {
        assert_eq!(
            router().route(&json!("this is urgent!")),
            Some("escalate")
        );
        assert_eq!(
            router().route(&json!({ "result": ["low", "urgent"] })),
            Some("escalate")
        );
    }

    #[test]
    fn test_route_when() {
        assert_eq!(router().route(&json!({ "score": 0.93 })), Some("publish"));
    }

    #[test]
    fn test_route_defaults_to_first_target() {
        assert_eq!(router().route(&json!("slack")), Some("escalate"));
        assert_eq!(router().route(&Value::Null), Some("escalate"));
    }

    fn edges_only(edges: Vec<Edge>) -> CompiledGraph {
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.source().to_string()).or_default().push(i);
        }
        CompiledGraph {
            key: FlowKey {
                flow_id: uuid::Uuid::nil(),
                version: 1,
            },
            nodes: HashMap::new(),
            edges,
            outgoing,
            metadata: GraphMetadata::default(),
        }
    }

    fn direct(from: &str, to: &str) -> Edge {
        Edge::Direct {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn test_downstream_follows_joins_and_branches() {
        let graph = edges_only(vec![
            direct(START, "a"),
            direct("a", "b1"),
            direct("a", "b2"),
            direct("b1", "join:b1+b2"),
            direct("b2", "join:b1+b2"),
            direct("join:b1+b2", "route"),
            Edge::Conditional {
                from: "route".to_string(),
                router: router(),
            },
            direct("publish", END),
        ]);

        let below_b2 = graph.downstream("b2");
        assert_eq!(
            below_b2.into_iter().collect::<Vec<_>>(),
            vec!["escalate", "export_step", "join:b1+b2", "publish", "route"]
        );
        assert!(!graph.downstream("a").contains("a"));
        assert!(graph.downstream("a").contains("b1"));
        assert!(graph.downstream("publish").is_empty());
    }

    #[test]
    fn test_join_id() {
        let id = join_id(&["b1".to_string(), "b2".to_string()]);
        assert_eq!(id, "join:b1+b2");
    }
}

//! Graph compiler: ordered step list -> `CompiledGraph`.
//!
//! Steps are grouped into contiguous execution groups (sequential, parallel,
//! or a singleton conditional group), then wired together:
//!
//! - sequential group: `step[i] -> step[i+1]`
//! - sequential -> next: `last -> first(next)`, fanning out if next is parallel
//! - parallel -> next: every member -> `join:<ids>` -> first(next) (or each)
//! - conditional: one conditional edge over the branch-table targets
//!
//! `__start__` feeds the first group and the last group drains into `__end__`.
//! Compilation is pure: no I/O, no clock.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;
use weft_types::flow::{FlowDefinition, StepNode};

use super::graph::{
    join_id, BranchRouter, CompiledGraph, Edge, GraphMetadata, GraphNode, JoinNode, RouteMatcher,
    RouteRule, END, START,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("no steps to compile")]
    NoSteps,

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step_id}' has a malformed branch rule: {reason}")]
    MalformedBranchRule { step_id: String, reason: String },

    #[error("step '{step_id}' branches to unknown step '{target}'")]
    UnknownBranchTarget { step_id: String, target: String },

    #[error("step '{step_id}' branches into parallel group member '{target}'")]
    BranchIntoParallel { step_id: String, target: String },

    #[error("cycle detected involving '{0}'")]
    CycleDetected(String),
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    Sequential,
    Parallel,
    Conditional,
}

/// A contiguous run of steps sharing one execution mode.
#[derive(Debug, Clone)]
pub struct ExecutionGroup<'a> {
    pub mode: GroupMode,
    pub steps: Vec<&'a StepNode>,
}

impl ExecutionGroup<'_> {
    pub fn ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    fn entries(&self) -> Vec<String> {
        match self.mode {
            GroupMode::Parallel => self.ids(),
            _ => self.steps.first().map(|s| vec![s.id.clone()]).unwrap_or_default(),
        }
    }
}

fn classify(step: &StepNode) -> GroupMode {
    if step.is_conditional() {
        GroupMode::Conditional
    } else if step.is_parallel() {
        GroupMode::Parallel
    } else {
        GroupMode::Sequential
    }
}

/// Split an ordered step list into execution groups.
pub fn group_steps(steps: &[StepNode]) -> Vec<ExecutionGroup<'_>> {
    let mut groups = Vec::new();
    let mut current: Option<ExecutionGroup<'_>> = None;

    for step in steps {
        let mode = classify(step);
        if mode == GroupMode::Conditional {
            if let Some(open) = current.take() {
                groups.push(open);
            }
            groups.push(ExecutionGroup {
                mode,
                steps: vec![step],
            });
            continue;
        }

        match current.as_mut() {
            Some(open) if open.mode == mode => open.steps.push(step),
            _ => {
                if let Some(open) = current.take() {
                    groups.push(open);
                }
                current = Some(ExecutionGroup {
                    mode,
                    steps: vec![step],
                });
            }
        }
    }

    if let Some(open) = current {
        groups.push(open);
    }
    groups
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

struct GraphBuilder {
    edges: Vec<Edge>,
    outgoing: HashMap<String, Vec<usize>>,
}

impl GraphBuilder {
    fn push(&mut self, edge: Edge) {
        self.outgoing
            .entry(edge.source().to_string())
            .or_default()
            .push(self.edges.len());
        self.edges.push(edge);
    }

    fn direct(&mut self, from: &str, to: &str) {
        self.push(Edge::Direct {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
}

/// Compile a flow definition into an executable graph.
pub fn compile(flow: &FlowDefinition) -> Result<CompiledGraph, CompileError> {
    if flow.steps.is_empty() {
        return Err(CompileError::NoSteps);
    }

    let mut step_ids = HashSet::new();
    for step in &flow.steps {
        if !step_ids.insert(step.id.as_str()) {
            return Err(CompileError::DuplicateStepId(step.id.clone()));
        }
    }

    let groups = group_steps(&flow.steps);

    let parallel_members: HashSet<&str> = groups
        .iter()
        .filter(|g| g.mode == GroupMode::Parallel && g.steps.len() > 1)
        .flat_map(|g| g.steps.iter().map(|s| s.id.as_str()))
        .collect();

    let mut nodes: HashMap<String, GraphNode> = flow
        .steps
        .iter()
        .map(|s| (s.id.clone(), GraphNode::Step(s.clone())))
        .collect();

    let mut builder = GraphBuilder {
        edges: Vec::new(),
        outgoing: HashMap::new(),
    };
    let mut join_nodes = Vec::new();

    if let Some(first) = groups.first() {
        for entry in first.entries() {
            builder.direct(START, &entry);
        }
    }

    for (i, group) in groups.iter().enumerate() {
        if group.mode == GroupMode::Sequential {
            for pair in group.steps.windows(2) {
                builder.direct(&pair[0].id, &pair[1].id);
            }
        }

        let next_entries = match groups.get(i + 1) {
            Some(next) => next.entries(),
            None => vec![END.to_string()],
        };

        match group.mode {
            GroupMode::Sequential => {
                if let Some(last) = group.steps.last() {
                    for entry in &next_entries {
                        builder.direct(&last.id, entry);
                    }
                }
            }
            GroupMode::Parallel => {
                let members = group.ids();
                let id = join_id(&members);
                for member in &members {
                    builder.direct(member, &id);
                }
                for entry in &next_entries {
                    builder.direct(&id, entry);
                }
                nodes.insert(
                    id.clone(),
                    GraphNode::Join(JoinNode {
                        id: id.clone(),
                        expected: members,
                    }),
                );
                join_nodes.push(id);
            }
            GroupMode::Conditional => {
                for step in &group.steps {
                    let router = build_router(step, &step_ids, &parallel_members)?;
                    builder.push(Edge::Conditional {
                        from: step.id.clone(),
                        router,
                    });
                }
            }
        }
    }

    check_acyclic(&nodes, &builder.edges)?;

    let metadata = GraphMetadata {
        step_count: flow.steps.len(),
        has_parallel: groups.iter().any(|g| g.mode == GroupMode::Parallel),
        has_conditional: groups.iter().any(|g| g.mode == GroupMode::Conditional),
        join_nodes,
    };

    tracing::debug!(
        flow = %flow.key(),
        steps = metadata.step_count,
        groups = groups.len(),
        joins = metadata.join_nodes.len(),
        "compiled flow graph"
    );

    Ok(CompiledGraph {
        key: flow.key(),
        nodes,
        edges: builder.edges,
        outgoing: builder.outgoing,
        metadata,
    })
}

fn build_router(
    step: &StepNode,
    step_ids: &HashSet<&str>,
    parallel_members: &HashSet<&str>,
) -> Result<BranchRouter, CompileError> {
    let mut rules = Vec::with_capacity(step.branches.len());

    for rule in &step.branches {
        let malformed = |reason: String| CompileError::MalformedBranchRule {
            step_id: step.id.clone(),
            reason,
        };

        let predicate = rule.predicate().map_err(|r| malformed(r.to_string()))?;
        let target = rule.target.trim();
        if target.is_empty() {
            return Err(malformed("empty target".to_string()));
        }
        if target != END && !step_ids.contains(target) {
            return Err(CompileError::UnknownBranchTarget {
                step_id: step.id.clone(),
                target: target.to_string(),
            });
        }
        if parallel_members.contains(target) {
            return Err(CompileError::BranchIntoParallel {
                step_id: step.id.clone(),
                target: target.to_string(),
            });
        }

        rules.push(RouteRule {
            matcher: RouteMatcher::from_predicate(predicate).map_err(malformed)?,
            target: target.to_string(),
        });
    }

    Ok(BranchRouter { rules })
}

/// Reject graphs whose edges (conditional candidates included) form a cycle.
fn check_acyclic(nodes: &HashMap<String, GraphNode>, edges: &[Edge]) -> Result<(), CompileError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index = HashMap::new();

    for id in [START, END]
        .into_iter()
        .chain(nodes.keys().map(String::as_str))
    {
        index.insert(id, graph.add_node(id));
    }

    for edge in edges {
        let Some(&from) = index.get(edge.source()) else {
            continue;
        };
        match edge {
            Edge::Direct { to, .. } => {
                if let Some(&to) = index.get(to.as_str()) {
                    graph.add_edge(from, to, ());
                }
            }
            Edge::Conditional { router, .. } => {
                for target in router.candidates() {
                    if let Some(&to) = index.get(target) {
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| CompileError::CycleDetected(graph[cycle.node_id()].to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

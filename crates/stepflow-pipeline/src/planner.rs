//! Planner: turns a validated configuration into nodes, edges and
//! conditional-edge groups.
//!
//! Steps are walked in declaration order. The first step is wired from
//! [`ENTRY`]. Plain and loop-aggregation steps emit one direct edge per
//! `next` target. A condition step emits no edges of its own; it becomes a
//! conditional-edge group keyed by its `prev`.

use stepflow_types::Result;

use crate::aggregator::Aggregator;
use crate::condition::ConditionRouter;
use crate::config::{StepKind, WorkflowConfig};
use crate::node::{GraphNode, StepNode};
use crate::schema::StateSchema;
use crate::validation::{validate_or_raise, Diagnostic, Severity};

/// Designated entry point of every graph.
pub const ENTRY: &str = "__start__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Edge {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Branching of one condition step, evaluated after `source` runs.
#[derive(Debug, Clone)]
pub struct ConditionalEdgeGroup {
    pub source: String,
    pub condition: String,
    pub router: ConditionRouter,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Edge>,
    pub conditional_groups: Vec<ConditionalEdgeGroup>,
    pub schema: StateSchema,
    /// Warnings left after validation.
    pub diagnostics: Vec<Diagnostic>,
}

impl Plan {
    pub fn outgoing<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.from == from)
    }
}

pub fn plan(config: &WorkflowConfig) -> Result<Plan> {
    let diagnostics = validate_or_raise(config)?;
    for d in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
        tracing::warn!(rule = %d.rule, step = ?d.step_id, "{}", d.message);
    }

    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let mut conditional_groups = Vec::new();

    for (i, step) in config.steps.iter().enumerate() {
        if i == 0 {
            edges.push(Edge::new(ENTRY, step.id.as_str()));
        }
        match &step.kind {
            StepKind::Plain(plain) => {
                nodes.push(GraphNode::Step(StepNode {
                    id: step.id.clone(),
                    name: step.name.clone(),
                    step: plain.clone(),
                }));
                if !plain.routed_by_condition {
                    direct_edges(config, &step.id, &plain.next, &mut edges);
                }
            }
            StepKind::LoopAggregation(agg) => {
                nodes.push(GraphNode::Aggregation(Aggregator::new(step.id.as_str(), agg.clone())));
                direct_edges(config, &step.id, &agg.next, &mut edges);
            }
            StepKind::Condition(cond) => conditional_groups.push(ConditionalEdgeGroup {
                source: cond.prev.clone(),
                condition: step.id.clone(),
                router: cond.router.clone(),
            }),
        }
    }

    tracing::debug!(
        nodes = nodes.len(),
        edges = edges.len(),
        groups = conditional_groups.len(),
        "Workflow planned"
    );

    Ok(Plan {
        nodes,
        edges,
        conditional_groups,
        schema: StateSchema::synthesize(&config.steps),
        diagnostics,
    })
}

/// A `next` naming a condition step is routed through that step's group.
fn direct_edges(config: &WorkflowConfig, from: &str, targets: &[String], edges: &mut Vec<Edge>) {
    for target in targets {
        if config.step(target).is_some_and(|s| s.is_condition()) {
            continue;
        }
        edges.push(Edge::new(from, target.as_str()));
    }
}

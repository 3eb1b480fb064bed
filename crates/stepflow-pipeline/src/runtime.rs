//! Graph runtime: compiles a [`Plan`] and drives one run state through it.
//!
//! The executor only depends on [`GraphRuntime`] and [`Graph`];
//! [`SequentialRuntime`] is the built-in implementation. It runs in
//! supersteps: every step of the frontier runs to completion, in order, and
//! its direct edges plus any conditional group keyed by it contribute the
//! next frontier. The run ends when the frontier is empty.
//!
//! A frontier step waits for the next superstep while another frontier step
//! can still reach it and it cannot reach that step back. A join therefore
//! runs once, after every live branch leading into it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use stepflow_types::{Checkpoint, Result, StepflowError};

use crate::checkpoint::CheckpointStore;
use crate::condition::ConditionRouter;
use crate::events::{EventEmitter, WorkflowEvent};
use crate::handler::{SessionContext, WorkloadRegistry};
use crate::node::GraphNode;
use crate::planner::{Plan, ENTRY};
use crate::state::RunState;

/// Everything a run needs besides the graph and its state.
#[derive(Clone)]
pub struct RunContext {
    pub session: SessionContext,
    pub workloads: Arc<WorkloadRegistry>,
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub events: Option<EventEmitter>,
    /// Upper bound on step visits in one run.
    pub max_steps: usize,
    /// Applied to steps that declare no timeout of their own.
    pub step_timeout: Option<Duration>,
}

impl RunContext {
    pub fn new(session: SessionContext, workloads: Arc<WorkloadRegistry>) -> Self {
        RunContext {
            session,
            workloads,
            checkpoints: None,
            events: None,
            max_steps: 200,
            step_timeout: None,
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    /// Step ids in visit order; repeated visits appear repeatedly.
    pub visited: Vec<String>,
}

/// A compiled, immutable graph. Safe to share between concurrent runs;
/// each run brings its own state.
#[async_trait]
pub trait Graph: Send + Sync {
    async fn run(&self, state: RunState, ctx: &RunContext) -> Result<RunOutcome>;

    fn node_ids(&self) -> Vec<String>;
}

pub trait GraphRuntime: Send + Sync {
    fn compile(&self, plan: &Plan) -> Result<Arc<dyn Graph>>;
}

// ---------------------------------------------------------------------------
// Sequential runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialRuntime;

impl GraphRuntime for SequentialRuntime {
    fn compile(&self, plan: &Plan) -> Result<Arc<dyn Graph>> {
        let nodes: IndexMap<String, GraphNode> = plan
            .nodes
            .iter()
            .map(|n| (n.id().to_string(), n.clone()))
            .collect();

        let mut entry = Vec::new();
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &plan.edges {
            if !nodes.contains_key(&edge.to) {
                return Err(StepflowError::Config(format!(
                    "edge {} -> {} does not lead to an executable step",
                    edge.from, edge.to
                )));
            }
            if edge.from == ENTRY {
                entry.push(edge.to.clone());
            } else {
                edges.entry(edge.from.clone()).or_default().push(edge.to.clone());
            }
        }
        if entry.len() != 1 {
            return Err(StepflowError::Config(format!(
                "entry point must have exactly one successor, found {}",
                entry.len()
            )));
        }

        let mut routers: HashMap<String, Vec<ConditionRouter>> = HashMap::new();
        for group in &plan.conditional_groups {
            if let Some(target) = group.router.all_targets().find(|t| !nodes.contains_key(*t)) {
                return Err(StepflowError::Config(format!(
                    "condition '{}' routes to '{target}', which is not an executable step",
                    group.condition
                )));
            }
            routers
                .entry(group.source.clone())
                .or_default()
                .push(group.router.clone());
        }

        let reach = reachability(&nodes, &edges, &routers);
        Ok(Arc::new(CompiledGraph {
            nodes,
            entry,
            edges,
            routers,
            reach,
        }))
    }
}

#[derive(Debug)]
pub struct CompiledGraph {
    nodes: IndexMap<String, GraphNode>,
    entry: Vec<String>,
    edges: HashMap<String, Vec<String>>,
    routers: HashMap<String, Vec<ConditionRouter>>,
    /// Steps reachable from each step in one or more hops, over direct edges
    /// and every branch target.
    reach: HashMap<String, HashSet<String>>,
}

fn reachability(
    nodes: &IndexMap<String, GraphNode>,
    edges: &HashMap<String, Vec<String>>,
    routers: &HashMap<String, Vec<ConditionRouter>>,
) -> HashMap<String, HashSet<String>> {
    let mut reach = HashMap::new();
    for start in nodes.keys() {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([start.as_str()]);
        while let Some(current) = queue.pop_front() {
            let direct = edges.get(current).into_iter().flatten();
            let branched = routers
                .get(current)
                .into_iter()
                .flatten()
                .flat_map(|r| r.all_targets());
            for next in direct.chain(branched) {
                if seen.insert(next.clone()) {
                    queue.push_back(next.as_str());
                }
            }
        }
        reach.insert(start.clone(), seen);
    }
    reach
}

impl CompiledGraph {
    fn reaches(&self, from: &str, to: &str) -> bool {
        self.reach.get(from).is_some_and(|r| r.contains(to))
    }

    /// Split a frontier into the steps that run now and the steps that wait
    /// because another frontier step can still lead into them. Steps that
    /// share a cycle never hold each other back.
    fn partition(&self, frontier: Vec<String>) -> (Vec<String>, Vec<String>) {
        let blocked: Vec<bool> = frontier
            .iter()
            .map(|id| {
                frontier
                    .iter()
                    .any(|p| p != id && self.reaches(p, id) && !self.reaches(id, p))
            })
            .collect();
        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for (id, blocked) in frontier.into_iter().zip(blocked) {
            if blocked {
                tracing::debug!(step = %id, "Step waiting on a pending predecessor");
                waiting.push(id);
            } else {
                ready.push(id);
            }
        }
        (ready, waiting)
    }

    /// Successors of `id` given the state after it ran.
    fn successors(&self, id: &str, state: &RunState, ctx: &RunContext) -> Result<Vec<String>> {
        let mut next: Vec<String> = self.edges.get(id).cloned().unwrap_or_default();
        for router in self.routers.get(id).into_iter().flatten() {
            let decision = router.route(state).map_err(|e| e.with_step(&router.step_id))?;
            tracing::debug!(
                condition = %router.step_id,
                branch = %decision.branch,
                targets = ?decision.targets,
                "Branch selected"
            );
            ctx.emit(WorkflowEvent::BranchSelected {
                condition: router.step_id.clone(),
                branch: decision.branch,
                targets: decision.targets.clone(),
            });
            next.extend(decision.targets);
        }
        Ok(next)
    }

    async fn checkpoint(&self, step: &str, state: &RunState, visited: &[String], ctx: &RunContext) -> Result<()> {
        let Some(store) = &ctx.checkpoints else {
            return Ok(());
        };
        let checkpoint = Checkpoint {
            thread_id: ctx.session.thread_id.clone(),
            namespace: ctx.session.namespace.clone(),
            timestamp: chrono::Utc::now(),
            last_step: Some(step.to_string()),
            visited: visited.to_vec(),
            state: state.to_map(),
        };
        store.put(&ctx.session.thread_id, checkpoint).await?;
        ctx.emit(WorkflowEvent::CheckpointSaved {
            step: step.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl Graph for CompiledGraph {
    async fn run(&self, mut state: RunState, ctx: &RunContext) -> Result<RunOutcome> {
        let mut frontier = self.entry.clone();
        let mut visited: Vec<String> = Vec::new();

        while !frontier.is_empty() {
            let (ready, mut waiting) = self.partition(frontier);
            if ready.is_empty() {
                return Err(StepflowError::Other(format!(
                    "steps {waiting:?} are waiting on each other"
                )));
            }
            let mut next_frontier: Vec<String> = Vec::new();
            for id in &ready {
                if visited.len() >= ctx.max_steps {
                    return Err(StepflowError::StepLimitExceeded {
                        limit: ctx.max_steps,
                    });
                }
                let node = self.nodes.get(id).ok_or_else(|| {
                    StepflowError::Other(format!("step '{id}' is not part of the compiled graph"))
                })?;

                tracing::debug!(step = %id, "Step started");
                ctx.emit(WorkflowEvent::StepStarted { step: id.clone() });
                let started = Instant::now();

                let update = match node.execute(&state, ctx).await {
                    Ok(update) => update,
                    Err(e) => {
                        tracing::debug!(step = %id, error = %e, "Step failed");
                        ctx.emit(WorkflowEvent::StepFailed {
                            step: id.clone(),
                            error: e.to_string(),
                        });
                        return Err(e);
                    }
                };
                state.apply(update)?;
                visited.push(id.clone());

                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(step = %id, duration_ms, "Step completed");
                ctx.emit(WorkflowEvent::StepCompleted {
                    step: id.clone(),
                    duration_ms,
                });

                self.checkpoint(id, &state, &visited, ctx).await?;

                for successor in self.successors(id, &state, ctx)? {
                    if !next_frontier.contains(&successor) {
                        next_frontier.push(successor);
                    }
                }
            }
            for successor in next_frontier {
                if !waiting.contains(&successor) {
                    waiting.push(successor);
                }
            }
            frontier = waiting;
        }

        Ok(RunOutcome { state, visited })
    }

    fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::handler::default_registry;
    use crate::planner::plan;
    use serde_json::{json, Value};
    use stepflow_definition::WorkflowDefinition;

    fn compile(nodes: Value) -> (Plan, Arc<dyn Graph>) {
        let def: WorkflowDefinition =
            serde_json::from_value(json!({"agent": {"id": "a"}, "nodes": nodes})).unwrap();
        let config = WorkflowConfig::from_definition(&def).unwrap();
        let plan = plan(&config).unwrap();
        let graph = SequentialRuntime.compile(&plan).unwrap();
        (plan, graph)
    }

    fn ctx() -> RunContext {
        RunContext::new(SessionContext::default(), Arc::new(default_registry()))
    }

    #[tokio::test]
    async fn fan_out_visits_each_successor_once() {
        let (plan, graph) = compile(json!([
            {"id": "A", "next": ["B", "C"]},
            {"id": "B", "next": "D"},
            {"id": "C", "next": "D"},
            {"id": "D"}
        ]));
        let outcome = graph.run(plan.schema.new_state(json!({})), &ctx()).await.unwrap();
        assert_eq!(outcome.visited, vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn join_waits_for_the_longer_branch() {
        let (plan, graph) = compile(json!([
            {"id": "A", "next": ["B", "C"]},
            {"id": "B", "next": "D"},
            {"id": "C", "next": "E"},
            {"id": "E", "next": "D"},
            {"id": "D"}
        ]));
        let outcome = graph.run(plan.schema.new_state(json!({})), &ctx()).await.unwrap();
        assert_eq!(outcome.visited, vec!["A", "B", "C", "E", "D"]);
    }

    #[tokio::test]
    async fn sibling_that_leads_into_a_step_runs_first() {
        let (plan, graph) = compile(json!([
            {"id": "A", "next": ["B", "C"]},
            {"id": "B", "next": "C"},
            {"id": "C"}
        ]));
        let outcome = graph.run(plan.schema.new_state(json!({})), &ctx()).await.unwrap();
        assert_eq!(outcome.visited, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn loop_hits_step_limit() {
        let (plan, graph) = compile(json!([
            {"id": "A", "next": "B"},
            {"id": "B", "next": "A"}
        ]));
        let mut ctx = ctx();
        ctx.max_steps = 5;
        let err = graph.run(plan.schema.new_state(json!({})), &ctx).await.unwrap_err();
        assert!(matches!(err, StepflowError::StepLimitExceeded { limit: 5 }));
    }

    #[tokio::test]
    async fn events_follow_the_run() {
        let (plan, graph) = compile(json!([{"id": "A"}]));
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let mut ctx = ctx();
        ctx.events = Some(emitter);
        graph.run(plan.schema.new_state(json!({})), &ctx).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), WorkflowEvent::StepStarted { .. }));
        assert!(matches!(rx.recv().await.unwrap(), WorkflowEvent::StepCompleted { .. }));
    }

    #[test]
    fn node_ids_follow_declaration_order() {
        let (_, graph) = compile(json!([{"id": "A", "next": "B"}, {"id": "B"}]));
        assert_eq!(graph.node_ids(), vec!["A", "B"]);
    }
}

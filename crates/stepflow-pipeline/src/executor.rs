//! Workflow executor: runs one input payload through a planned context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use stepflow_types::{Phase, Record, Result, StepflowError};

use crate::checkpoint::CheckpointStore;
use crate::config::OutputSpec;
use crate::context::ExecutionContext;
use crate::events::{EventEmitter, WorkflowEvent};
use crate::handler::{SessionContext, WorkloadRegistry};
use crate::params::{build_params, coerce_input, dependencies};
use crate::reference::{resolve, root};
use crate::runtime::{GraphRuntime, RunContext, RunOutcome, SequentialRuntime};
use crate::state::RunState;

/// Default upper bound on step visits per run.
pub const DEFAULT_MAX_STEPS: usize = 200;

#[derive(Clone)]
pub struct ExecutorConfig {
    pub max_steps: usize,
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub events: Option<EventEmitter>,
    /// Fixed session id for every run; overrides the context's own.
    pub session_id: Option<String>,
    pub step_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            checkpoints: None,
            events: None,
            session_id: None,
            step_timeout: None,
        }
    }
}

pub struct WorkflowExecutor {
    runtime: Arc<dyn GraphRuntime>,
    workloads: Arc<WorkloadRegistry>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(workloads: WorkloadRegistry) -> Self {
        Self {
            runtime: Arc::new(SequentialRuntime),
            workloads: Arc::new(workloads),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_runtime(mut self, runtime: impl GraphRuntime + 'static) -> Self {
        self.runtime = Arc::new(runtime);
        self
    }

    /// Run `input` through the planned graph of `ctx` and return the
    /// workflow output.
    ///
    /// Nothing is returned on failure: the error is surfaced, the context
    /// goes back to `Planned`, and no partial output is recorded.
    pub async fn execute(&self, ctx: &mut ExecutionContext, input: Value) -> Result<Value> {
        match ctx.phase {
            Phase::Planned | Phase::Executed => {}
            other => {
                return Err(StepflowError::Other(format!(
                    "cannot execute a context in phase '{other}'; plan it first"
                )))
            }
        }
        let Some(plan) = ctx.plan.as_ref() else {
            return Err(StepflowError::Other("context has no plan".into()));
        };

        ctx.phase = Phase::Executing;
        let graph = match &ctx.graph {
            Some(graph) => graph.clone(),
            None => match self.runtime.compile(plan) {
                Ok(graph) => {
                    ctx.graph = Some(graph.clone());
                    graph
                }
                Err(e) => {
                    ctx.phase = Phase::Planned;
                    return Err(e);
                }
            },
        };

        let run_id = self
            .config
            .session_id
            .clone()
            .or_else(|| ctx.session_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        ctx.run_id = Some(run_id.clone());
        let workflow = ctx.config.agent.id.clone();

        let run_ctx = RunContext {
            session: SessionContext {
                thread_id: run_id.clone(),
                namespace: workflow.clone(),
                settings: ctx.settings.clone(),
            },
            workloads: self.workloads.clone(),
            checkpoints: self.config.checkpoints.clone(),
            events: self.config.events.clone(),
            max_steps: self.config.max_steps,
            step_timeout: self.config.step_timeout,
        };

        tracing::info!(workflow = %workflow, run_id = %run_id, "Run started");
        self.emit(WorkflowEvent::RunStarted {
            workflow: workflow.clone(),
            run_id: run_id.clone(),
            step_count: ctx.config.steps.len(),
        });
        let started = Instant::now();

        let result = async {
            let input = coerce_input(&ctx.config.agent.input, input)?;
            let mut state = plan.schema.new_state(input);
            self.restore(&mut state, &run_ctx).await?;
            let RunOutcome { mut state, visited } = graph.run(state, &run_ctx).await?;
            let output = extract_output(&ctx.config.agent.output, &state)?;
            state.set_output(output.clone());
            Ok::<_, StepflowError>((output, state, visited))
        }
        .await;

        match result {
            Ok((output, state, visited)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(
                    workflow = %workflow,
                    run_id = %run_id,
                    steps = visited.len(),
                    duration_ms,
                    "Run completed"
                );
                self.emit(WorkflowEvent::RunCompleted {
                    workflow,
                    run_id,
                    visited,
                    duration_ms,
                });
                ctx.final_state = Some(state);
                ctx.output = Some(output.clone());
                ctx.phase = Phase::Executed;
                Ok(output)
            }
            Err(e) => {
                tracing::error!(
                    workflow = %workflow,
                    run_id = %run_id,
                    category = e.category(),
                    error = %e,
                    "Run failed"
                );
                self.emit(WorkflowEvent::RunFailed {
                    workflow,
                    run_id,
                    error: e.to_string(),
                });
                ctx.phase = Phase::Planned;
                Err(e)
            }
        }
    }

    /// Copy slots from the session's checkpoint when it belongs to the same
    /// workflow.
    async fn restore(&self, state: &mut RunState, run_ctx: &RunContext) -> Result<()> {
        let Some(store) = &run_ctx.checkpoints else {
            return Ok(());
        };
        let session = &run_ctx.session;
        match store.get(&session.thread_id).await? {
            Some(cp) if cp.namespace == session.namespace => {
                let restored = state.restore(&cp.state);
                tracing::info!(run_id = %session.thread_id, restored, "Restored checkpointed state");
            }
            Some(cp) => {
                tracing::debug!(
                    run_id = %session.thread_id,
                    namespace = %cp.namespace,
                    "Ignoring checkpoint of another workflow"
                );
            }
            None => {}
        }
        Ok(())
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(events) = &self.config.events {
            events.emit(event);
        }
    }
}

/// Build the workflow output from the final state. Every slot the output
/// reads must hold a value.
pub fn extract_output(output: &OutputSpec, state: &RunState) -> Result<Value> {
    let roots: Vec<String> = match output {
        OutputSpec::Reference(path) => root(path).map(String::from).into_iter().collect(),
        OutputSpec::Fields(fields) => dependencies(fields),
    };
    for slot in &roots {
        match state.get(slot) {
            Some(v) if !v.is_null() => {}
            Some(_) => {
                return Err(StepflowError::reference(
                    slot.as_str(),
                    format!("output depends on '{slot}', which was never written"),
                ))
            }
            None => {
                return Err(StepflowError::reference(
                    slot.as_str(),
                    format!("output depends on unknown state field '{slot}'"),
                ))
            }
        }
    }
    match output {
        OutputSpec::Reference(path) => resolve(path, state),
        OutputSpec::Fields(fields) => build_params(fields, state).map(Value::Object),
    }
}

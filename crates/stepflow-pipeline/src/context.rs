//! Per-run execution context: parse, plan, then hand to the executor.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use stepflow_definition::DefinitionSource;
use stepflow_types::{Phase, Result, StepflowError};

use crate::config::WorkflowConfig;
use crate::planner::{self, Plan};
use crate::runtime::Graph;
use crate::settings::RunSettings;
use crate::state::RunState;
use crate::validation::Diagnostic;

/// State of one workflow instantiation.
///
/// Owned by exactly one in-flight run. The phase only moves forward,
/// except that a failed plan returns to `Parsed` and a failed run returns to
/// `Planned` so the caller can retry.
pub struct ExecutionContext {
    pub(crate) phase: Phase,
    pub(crate) config: WorkflowConfig,
    pub(crate) settings: RunSettings,
    pub(crate) plan: Option<Plan>,
    pub(crate) graph: Option<Arc<dyn Graph>>,
    pub(crate) session_id: Option<String>,
    pub(crate) run_id: Option<String>,
    pub(crate) final_state: Option<RunState>,
    pub(crate) output: Option<Value>,
}

impl ExecutionContext {
    /// Load a definition, build its configuration and merge settings.
    pub fn parse(
        source: impl Into<DefinitionSource>,
        env_overrides: &IndexMap<String, Value>,
    ) -> Result<Self> {
        let mut phase = Phase::Initial;
        tracing::debug!(%phase, "Creating execution context");
        phase = Phase::Parsing;
        tracing::debug!(%phase, "Reading workflow definition");

        let definition = source.into().load()?;
        let config = WorkflowConfig::from_definition(&definition)?;
        let settings = RunSettings::merge(&config.agent.env, env_overrides)?;
        phase = Phase::Parsed;
        tracing::info!(
            agent = %config.agent.id,
            steps = config.steps.len(),
            settings = settings.len(),
            %phase,
            "Workflow parsed"
        );

        Ok(ExecutionContext {
            phase,
            config,
            settings,
            plan: None,
            graph: None,
            session_id: None,
            run_id: None,
            final_state: None,
            output: None,
        })
    }

    /// Build nodes, edges and conditional groups. Any earlier plan and
    /// compiled graph are discarded.
    pub fn plan(&mut self) -> Result<()> {
        match self.phase {
            Phase::Parsed | Phase::Planned | Phase::Executed => {}
            other => {
                return Err(StepflowError::Other(format!(
                    "cannot plan a context in phase '{other}'"
                )))
            }
        }
        self.phase = Phase::Planning;
        self.plan = None;
        self.graph = None;

        match planner::plan(&self.config) {
            Ok(plan) => {
                tracing::info!(
                    agent = %self.config.agent.id,
                    nodes = plan.nodes.len(),
                    edges = plan.edges.len(),
                    groups = plan.conditional_groups.len(),
                    "Workflow planned"
                );
                self.plan = Some(plan);
                self.phase = Phase::Planned;
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Parsed;
                Err(e)
            }
        }
    }

    /// Mark the context as done; it cannot be planned or executed again.
    pub fn finish(&mut self) {
        self.graph = None;
        self.phase = Phase::Finished;
        tracing::debug!(agent = %self.config.agent.id, "Execution context finished");
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn planned(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Lint warnings that survived planning.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.plan.as_ref().map(|p| p.diagnostics.as_slice()).unwrap_or(&[])
    }

    /// Use a fixed session id so runs share checkpointed state.
    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Session/thread id used by the most recent run.
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn final_state(&self) -> Option<&RunState> {
        self.final_state.as_ref()
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("phase", &self.phase)
            .field("agent", &self.config.agent.id)
            .field("steps", &self.config.steps.len())
            .field("planned", &self.plan.is_some())
            .field("compiled", &self.graph.is_some())
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// `parse(definitionSource, envOverrides) -> Context`.
pub fn parse(
    source: impl Into<DefinitionSource>,
    env_overrides: &IndexMap<String, Value>,
) -> Result<ExecutionContext> {
    ExecutionContext::parse(source, env_overrides)
}

/// `plan(context)`: plans the context in place.
pub fn plan(ctx: &mut ExecutionContext) -> Result<()> {
    ctx.plan()
}

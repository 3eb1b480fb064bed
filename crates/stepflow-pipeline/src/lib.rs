//! Workflow compiler and executor.
//!
//! This crate turns a workflow definition into an executable graph and
//! drives one input payload through it: typed configuration and lint rules,
//! the reference resolver, the condition evaluator, state schema synthesis,
//! the planner, loop aggregation, and the executor with its workload,
//! checkpoint and event collaborators.
//!
//! ```no_run
//! # async fn demo() -> stepflow_types::Result<()> {
//! use stepflow_pipeline::{default_registry, parse, plan, WorkflowExecutor};
//!
//! let mut ctx = parse(std::path::Path::new("flow.yaml"), &Default::default())?;
//! plan(&mut ctx)?;
//! let executor = WorkflowExecutor::new(default_registry());
//! let output = executor.execute(&mut ctx, serde_json::json!({"msg": "hi"})).await?;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod checkpoint;
pub mod condition;
pub mod config;
pub mod context;
pub mod events;
pub mod executor;
pub mod handler;
pub mod node;
pub mod params;
pub mod planner;
pub mod reference;
pub mod runtime;
pub mod schema;
pub mod settings;
pub mod state;
pub mod validation;

pub use aggregator::{AggregateRecord, Aggregator};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use condition::{
    evaluate, is_truthy, ConditionBranch, ConditionClause, ConditionRouter, Operand, Operator,
    RouteDecision,
};
pub use config::{
    AggregateType, AggregationSpec, AggregationStep, ConditionStep, FieldMap, FieldSpec,
    OutputSpec, PlainStep, StepDefinition, StepKind, ValueSource, WorkflowConfig,
};
pub use context::{parse, plan, ExecutionContext};
pub use events::{EventEmitter, WorkflowEvent};
pub use executor::{extract_output, ExecutorConfig, WorkflowExecutor, DEFAULT_MAX_STEPS};
pub use handler::{default_registry, EchoWorkload, SessionContext, StepWorkload, WorkloadRegistry};
pub use node::{GraphNode, StepNode};
pub use params::{build_params, coerce_input, dependencies};
pub use planner::{ConditionalEdgeGroup, Edge, Plan, ENTRY};
pub use reference::{lookup, resolve};
pub use runtime::{CompiledGraph, Graph, GraphRuntime, RunContext, RunOutcome, SequentialRuntime};
pub use schema::{SlotKind, StateField, StateSchema, WORKFLOW_INPUT, WORKFLOW_OUTPUT};
pub use settings::{RunSettings, Setting};
pub use state::{RunState, StateUpdate};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};

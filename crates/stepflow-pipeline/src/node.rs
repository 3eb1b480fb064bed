//! Executable graph nodes: workload steps and aggregation steps.

use std::time::Duration;

use serde_json::{Map, Value};
use stepflow_types::{Result, StepflowError};

use crate::aggregator::Aggregator;
use crate::config::{FieldMap, PlainStep, ValueSource};
use crate::params::{build_params, resolve_field};
use crate::runtime::RunContext;
use crate::schema::{input_slot, output_slot};
use crate::state::{RunState, StateUpdate};

/// Key a non-mapping workload result is stored under.
pub const RESULT_KEY: &str = "_result";

/// A plain step bound to its id.
#[derive(Debug, Clone)]
pub struct StepNode {
    pub id: String,
    pub name: String,
    pub step: PlainStep,
}

impl StepNode {
    /// Build the input, run the workload, and return the step's two slots.
    pub async fn execute(&self, state: &RunState, ctx: &RunContext) -> Result<StateUpdate> {
        let input = build_params(&self.step.input, state).map_err(|e| e.with_step(&self.id))?;
        tracing::debug!(
            step = %self.id,
            workload = %self.step.workload,
            reads = ?self.step.input_dependencies(),
            "Invoking workload"
        );

        let workload = ctx.workloads.resolve(&self.step.workload).ok_or_else(|| {
            StepflowError::Workload {
                step: self.id.clone(),
                message: format!("no workload registered for type '{}'", self.step.workload),
            }
        })?;

        let call = workload.invoke(self, &input, &ctx.session);
        let result = match self.step.timeout.or(ctx.step_timeout) {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| self.timed_out(limit))?,
            None => call.await,
        };
        let result = result.map_err(|e| match e {
            StepflowError::Workload { .. } => e,
            other => StepflowError::Workload {
                step: self.id.clone(),
                message: other.to_string(),
            },
        })?;

        let output = self.shape_output(normalize(result), state)?;
        let mut update = StateUpdate::new();
        update.insert(input_slot(&self.id), Value::Object(input));
        update.insert(output_slot(&self.id), Value::Object(output));
        Ok(update)
    }

    fn timed_out(&self, limit: Duration) -> StepflowError {
        StepflowError::Workload {
            step: self.id.clone(),
            message: format!("timed out after {}ms", limit.as_millis()),
        }
    }

    /// Coerce the declared output fields of `result`. Declared fields the
    /// workload did not return fall back to their literal, reference or
    /// default; undeclared keys pass through.
    fn shape_output(&self, mut result: Map<String, Value>, state: &RunState) -> Result<Map<String, Value>> {
        shape(&self.step.output, &mut result, state).map_err(|e| e.with_step(&self.id))?;
        Ok(result)
    }
}

fn shape(fields: &FieldMap, result: &mut Map<String, Value>, state: &RunState) -> Result<()> {
    for (name, spec) in fields {
        let value = match result.get_mut(name) {
            Some(Value::Object(nested)) if spec.schema.is_some() => {
                if let Some(schema) = &spec.schema {
                    shape(schema, nested, state)?;
                }
                continue;
            }
            Some(v) if !v.is_null() => spec.value_kind.coerce(v).map_err(|e| e.with_field(name))?,
            _ => match &spec.value {
                ValueSource::Unset if spec.schema.is_none() => spec.value_kind.default_value(),
                _ => resolve_field(name, spec, state)?,
            },
        };
        result.insert(name.clone(), value);
    }
    Ok(())
}

/// Mapping results are kept; anything else is wrapped as `{"_result": v}`.
pub fn normalize(result: Value) -> Map<String, Value> {
    match result {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert(RESULT_KEY.to_string(), other);
            map
        }
    }
}

/// A node of the compiled graph.
#[derive(Debug, Clone)]
pub enum GraphNode {
    Step(StepNode),
    Aggregation(Aggregator),
}

impl GraphNode {
    pub fn id(&self) -> &str {
        match self {
            GraphNode::Step(s) => &s.id,
            GraphNode::Aggregation(a) => &a.step_id,
        }
    }

    pub async fn execute(&self, state: &RunState, ctx: &RunContext) -> Result<StateUpdate> {
        match self {
            GraphNode::Step(step) => step.execute(state, ctx).await,
            GraphNode::Aggregation(agg) => agg.visit(state),
        }
    }
}

//! Per-run state schema synthesized from the step list.
//!
//! Plain steps get `{id}_input` and `{id}_output` slots, loop-aggregation
//! steps a single `{id}_output` slot holding their aggregate record, and
//! condition steps none. `workflow_input` and `workflow_output` are always
//! present. The schema is derived, never maintained by hand.

use serde::Serialize;
use serde_json::Value;

use crate::config::{StepDefinition, StepKind};
use crate::state::RunState;

pub const WORKFLOW_INPUT: &str = "workflow_input";
pub const WORKFLOW_OUTPUT: &str = "workflow_output";

pub fn input_slot(step_id: &str) -> String {
    format!("{step_id}_input")
}

pub fn output_slot(step_id: &str) -> String {
    format!("{step_id}_output")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    WorkflowInput,
    WorkflowOutput,
    StepInput,
    StepOutput,
    /// `{counter, items, aggregation}` record of a loop-aggregation step.
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateField {
    pub name: String,
    pub kind: SlotKind,
    pub required: bool,
    /// Step that writes this slot; `None` for the fixed fields.
    pub step: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSchema {
    pub fields: Vec<StateField>,
}

impl StateSchema {
    /// Build the schema for `steps`: the fixed fields first, then the step
    /// slots in declaration order.
    pub fn synthesize(steps: &[StepDefinition]) -> Self {
        let mut fields = vec![
            StateField {
                name: WORKFLOW_INPUT.into(),
                kind: SlotKind::WorkflowInput,
                required: true,
                step: None,
            },
            StateField {
                name: WORKFLOW_OUTPUT.into(),
                kind: SlotKind::WorkflowOutput,
                required: false,
                step: None,
            },
        ];
        for step in steps {
            let owner = Some(step.id.clone());
            match &step.kind {
                StepKind::Plain(_) => {
                    fields.push(StateField {
                        name: input_slot(&step.id),
                        kind: SlotKind::StepInput,
                        required: false,
                        step: owner.clone(),
                    });
                    fields.push(StateField {
                        name: output_slot(&step.id),
                        kind: SlotKind::StepOutput,
                        required: false,
                        step: owner,
                    });
                }
                StepKind::LoopAggregation(_) => fields.push(StateField {
                    name: output_slot(&step.id),
                    kind: SlotKind::Aggregate,
                    required: false,
                    step: owner,
                }),
                StepKind::Condition(_) => {}
            }
        }
        StateSchema { fields }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&StateField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Slots written by steps, excluding the fixed fields.
    pub fn step_fields(&self) -> impl Iterator<Item = &StateField> {
        self.fields.iter().filter(|f| f.step.is_some())
    }

    /// A fresh run state with every slot null except `workflow_input`.
    pub fn new_state(&self, input: Value) -> RunState {
        let mut state = RunState::new(self);
        state.seed_input(input);
        state
    }
}

use indexmap::IndexMap;
use serde_json::{Map, Value};
use stepflow_types::{Record, Result, StepflowError};

use crate::schema::{StateSchema, WORKFLOW_INPUT, WORKFLOW_OUTPUT};

/// Slot writes produced by one step visit.
pub type StateUpdate = IndexMap<String, Value>;

/// Mutable state of one workflow run.
///
/// Holds exactly the slots of the [`StateSchema`] it was created from; a
/// slot that has not been written yet holds `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    fields: IndexMap<String, Value>,
}

impl RunState {
    pub fn new(schema: &StateSchema) -> Self {
        RunState {
            fields: schema
                .fields
                .iter()
                .map(|f| (f.name.clone(), Value::Null))
                .collect(),
        }
    }

    pub fn value(&self, slot: &str) -> Option<&Value> {
        self.fields.get(slot)
    }

    pub fn seed_input(&mut self, input: Value) {
        self.fields.insert(WORKFLOW_INPUT.to_string(), input);
    }

    pub fn set_output(&mut self, output: Value) {
        self.fields.insert(WORKFLOW_OUTPUT.to_string(), output);
    }

    /// Write every slot of `update`. Writing a slot the schema does not
    /// declare is an error and leaves the state untouched.
    pub fn apply(&mut self, update: StateUpdate) -> Result<()> {
        if let Some(unknown) = update.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(StepflowError::Other(format!(
                "state has no slot '{unknown}'"
            )));
        }
        for (slot, value) in update {
            self.fields.insert(slot, value);
        }
        Ok(())
    }

    /// Copy slots from a checkpointed state. Slots the current schema does
    /// not declare are dropped; `workflow_input` and `workflow_output` are
    /// never restored.
    pub fn restore(&mut self, saved: &Map<String, Value>) -> usize {
        let mut restored = 0;
        for (slot, value) in saved {
            if slot == WORKFLOW_INPUT || slot == WORKFLOW_OUTPUT {
                continue;
            }
            if let Some(current) = self.fields.get_mut(slot) {
                *current = value.clone();
                restored += 1;
            }
        }
        restored
    }

    pub fn to_map(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn slots(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

impl Record for RunState {
    fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

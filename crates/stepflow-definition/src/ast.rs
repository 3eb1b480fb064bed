use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepflow_types::ValueKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub agent: AgentDefinition,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub env: IndexMap<String, EnvDefinition>,
    #[serde(default)]
    pub input: IndexMap<String, FieldDefinition>,
    #[serde(default)]
    pub output: OutputDefinition,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvDefinition {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub value_type: ValueKind,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    #[serde(alias = "literal")]
    Input,
    Reference,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub value_type: ValueKind,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub source: Option<FieldSource>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub value_schema: Option<IndexMap<String, FieldDefinition>>,
}

/// The agent's output is either a field map or a single reference path
/// whose value becomes the whole output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputDefinition {
    Reference(String),
    Fields(IndexMap<String, FieldDefinition>),
}

impl Default for OutputDefinition {
    fn default() -> Self {
        OutputDefinition::Fields(IndexMap::new())
    }
}

/// A successor: one step id or an ordered list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    One(String),
    Many(Vec<String>),
}

impl Targets {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Targets::One(id) => vec![id.clone()],
            Targets::Many(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClauseDefinition {
    pub operator: String,
    pub operand: String,
    #[serde(default)]
    pub op_type: Option<ValueKind>,
    #[serde(default)]
    pub source: Option<FieldSource>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionDefinition {
    pub logic_operator: LogicOperator,
    #[serde(default)]
    pub condition: Vec<ClauseDefinition>,
    #[serde(default)]
    pub next: Option<Targets>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationDefinition {
    pub reference: String,
    pub agg_type: String,
    #[serde(default)]
    pub value_type: Option<ValueKind>,
}

fn default_node_type() -> String {
    "base_agent".to_string()
}

/// One entry of `nodes`. The shape is flat; which keys are meaningful
/// depends on `node_type`, and is checked when the definition is compiled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: String,
    #[serde(default)]
    pub input: IndexMap<String, FieldDefinition>,
    #[serde(default)]
    pub output: IndexMap<String, FieldDefinition>,
    #[serde(default)]
    pub next: Option<Targets>,
    #[serde(default)]
    pub next_type: Option<String>,
    #[serde(default)]
    pub prev: Option<String>,
    #[serde(rename = "if", default)]
    pub if_branch: Option<ConditionDefinition>,
    #[serde(rename = "elif", default)]
    pub elif_branches: Vec<ConditionDefinition>,
    #[serde(rename = "else", default)]
    pub else_targets: Option<Targets>,
    #[serde(default)]
    pub aggregation: IndexMap<String, AggregationDefinition>,
    /// Workload-specific keys (`system_prompt`, `mcp`, `debug`, ...), handed
    /// to the workload untouched.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

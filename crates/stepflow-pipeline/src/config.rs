//! Typed workflow configuration built from a raw definition document.
//!
//! [`WorkflowConfig::from_definition`] closes the open-ended document shape
//! into tagged variants: every field is a literal, a reference or unset, and
//! every step is plain, condition or loop-aggregation. Shape errors are
//! reported here as [`StepflowError::Config`]; graph-level checks (dangling
//! targets, duplicate ids, ...) live in [`crate::validation`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use stepflow_definition::{
    AgentDefinition, AggregationDefinition, ClauseDefinition, ConditionDefinition,
    EnvDefinition, FieldDefinition, FieldSource, NodeDefinition, OutputDefinition,
    WorkflowDefinition,
};
use stepflow_types::{Result, StepflowError, ValueKind};

use crate::condition::{ConditionBranch, ConditionClause, ConditionRouter, Operand, Operator};

pub type FieldMap = IndexMap<String, FieldSpec>;

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Where a field's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSource {
    /// A value fixed in the definition, already coerced to the field's kind.
    Literal(Value),
    /// A dotted path into the run state.
    Reference(String),
    /// Neither value nor reference; the field takes its kind's default.
    Unset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub value_kind: ValueKind,
    pub value: ValueSource,
    pub required: bool,
    pub description: Option<String>,
    /// Nested fields of a `dict` field, built the same way as the outer map.
    pub schema: Option<FieldMap>,
}

impl FieldSpec {
    pub fn literal(value_kind: ValueKind, value: Value) -> Self {
        FieldSpec {
            value_kind,
            value: ValueSource::Literal(value),
            required: false,
            description: None,
            schema: None,
        }
    }

    pub fn reference(value_kind: ValueKind, path: impl Into<String>) -> Self {
        FieldSpec {
            value_kind,
            value: ValueSource::Reference(path.into()),
            required: false,
            description: None,
            schema: None,
        }
    }

    pub fn reference_path(&self) -> Option<&str> {
        match &self.value {
            ValueSource::Reference(path) => Some(path),
            _ => None,
        }
    }

    fn from_definition(name: &str, def: &FieldDefinition) -> Result<Self> {
        let value = match def.source {
            Some(FieldSource::Reference) => match non_empty(def.reference.as_deref()) {
                Some(path) => ValueSource::Reference(path.to_string()),
                None => {
                    return Err(StepflowError::Config(format!(
                        "field '{name}' has source 'reference' but no reference path"
                    )))
                }
            },
            Some(FieldSource::Input) => match &def.value {
                Some(v) => ValueSource::Literal(v.clone()),
                None => ValueSource::Unset,
            },
            None => match (non_empty(def.reference.as_deref()), &def.value) {
                (Some(_), Some(_)) => {
                    return Err(StepflowError::Config(format!(
                        "field '{name}' sets both value and reference; add 'source' to pick one"
                    )))
                }
                (Some(path), None) => ValueSource::Reference(path.to_string()),
                (None, Some(v)) => ValueSource::Literal(v.clone()),
                (None, None) => ValueSource::Unset,
            },
        };
        let value = match value {
            ValueSource::Literal(v) => ValueSource::Literal(
                def.value_type
                    .coerce(&v)
                    .map_err(|e| e.with_field(name))?,
            ),
            other => other,
        };
        let schema = def
            .value_schema
            .as_ref()
            .map(field_map_from_definition)
            .transpose()?;
        Ok(FieldSpec {
            value_kind: def.value_type,
            value,
            required: def.required.unwrap_or(false),
            description: def.description.clone(),
            schema,
        })
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

pub fn field_map_from_definition(defs: &IndexMap<String, FieldDefinition>) -> Result<FieldMap> {
    defs.iter()
        .map(|(name, def)| Ok((name.clone(), FieldSpec::from_definition(name, def)?)))
        .collect()
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum OutputSpec {
    /// The resolved value of this path is the whole workflow output.
    Reference(String),
    Fields(FieldMap),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub env: IndexMap<String, EnvDefinition>,
    pub input: FieldMap,
    pub output: OutputSpec,
}

impl AgentConfig {
    fn from_definition(def: &AgentDefinition) -> Result<Self> {
        let id = match non_empty(def.id.as_deref()) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let output = match &def.output {
            OutputDefinition::Reference(path) => match non_empty(Some(path.as_str())) {
                Some(path) => OutputSpec::Reference(path.to_string()),
                None => OutputSpec::Fields(FieldMap::new()),
            },
            OutputDefinition::Fields(fields) => OutputSpec::Fields(
                field_map_from_definition(fields)
                    .map_err(|e| prefix_config(e, "agent output"))?,
            ),
        };
        Ok(AgentConfig {
            name: if def.name.is_empty() { id.clone() } else { def.name.clone() },
            id,
            description: def.description.clone(),
            env: def.env.clone(),
            input: field_map_from_definition(&def.input)
                .map_err(|e| prefix_config(e, "agent input"))?,
            output,
        })
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Node types that run a workload. The type names the workload to use.
pub const PLAIN_STEP_TYPES: &[&str] = &["base_agent", "sdk", "rag"];
pub const CONDITION_TYPE: &str = "condition";
pub const LOOP_AGGREGATION_TYPE: &str = "loop_aggregation";

#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Plain(PlainStep),
    Condition(ConditionStep),
    LoopAggregation(AggregationStep),
}

#[derive(Debug, Clone)]
pub struct PlainStep {
    pub workload: String,
    pub input: FieldMap,
    pub output: FieldMap,
    /// Direct successors, in declaration order.
    pub next: Vec<String>,
    /// `next_type: condition`; the successor is picked by the condition
    /// step whose `prev` is this step.
    pub routed_by_condition: bool,
    pub timeout: Option<Duration>,
    /// Workload-specific keys passed through untouched.
    pub options: IndexMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ConditionStep {
    pub prev: String,
    pub router: ConditionRouter,
}

#[derive(Debug, Clone)]
pub struct AggregationStep {
    pub aggregation: IndexMap<String, AggregationSpec>,
    pub next: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSpec {
    pub reference: String,
    pub agg_type: AggregateType,
    pub value_kind: Option<ValueKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateType {
    Sum,
    Mean,
    List,
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregateType::Sum => "sum",
            AggregateType::Mean => "mean",
            AggregateType::List => "list",
        })
    }
}

impl FromStr for AggregateType {
    type Err = StepflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(AggregateType::Sum),
            "mean" => Ok(AggregateType::Mean),
            "list" => Ok(AggregateType::List),
            other => Err(StepflowError::Config(format!(
                "unknown aggregation type '{other}' (expected sum, mean or list)"
            ))),
        }
    }
}

impl StepDefinition {
    pub fn is_plain(&self) -> bool {
        matches!(self.kind, StepKind::Plain(_))
    }

    pub fn is_condition(&self) -> bool {
        matches!(self.kind, StepKind::Condition(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Plain(_) => "plain",
            StepKind::Condition(_) => CONDITION_TYPE,
            StepKind::LoopAggregation(_) => LOOP_AGGREGATION_TYPE,
        }
    }

    /// Statically known successors. Condition steps have none.
    pub fn direct_targets(&self) -> &[String] {
        match &self.kind {
            StepKind::Plain(p) => &p.next,
            StepKind::LoopAggregation(a) => &a.next,
            StepKind::Condition(_) => &[],
        }
    }

    fn from_definition(index: usize, def: &NodeDefinition) -> Result<Self> {
        let id = non_empty(def.id.as_deref())
            .ok_or_else(|| StepflowError::Config(format!("node #{index} has no id")))?
            .to_string();
        let kind = match def.node_type.as_str() {
            t if PLAIN_STEP_TYPES.contains(&t) => StepKind::Plain(plain_step(def)?),
            CONDITION_TYPE => StepKind::Condition(condition_step(&id, def)?),
            LOOP_AGGREGATION_TYPE => StepKind::LoopAggregation(aggregation_step(&id, def)?),
            other => {
                return Err(StepflowError::Config(format!(
                    "unknown node type '{other}'"
                )))
            }
        };
        let name = if def.name.is_empty() { id.clone() } else { def.name.clone() };
        Ok(StepDefinition { id, name, kind })
    }
}

fn plain_step(def: &NodeDefinition) -> Result<PlainStep> {
    let routed_by_condition = match def.next_type.as_deref() {
        None | Some("") | Some("node") => false,
        Some(CONDITION_TYPE) => true,
        Some(other) => {
            return Err(StepflowError::Config(format!(
                "unknown next_type '{other}' (expected condition)"
            )))
        }
    };
    let mut options = def.extra.clone();
    let timeout = match options.shift_remove("timeout") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let secs = v
                .as_f64()
                .filter(|s| s.is_finite() && *s > 0.0)
                .ok_or_else(|| {
                    StepflowError::Config(format!("timeout must be a positive number of seconds, got {v}"))
                })?;
            Some(Duration::from_secs_f64(secs))
        }
    };
    Ok(PlainStep {
        workload: def.node_type.clone(),
        input: field_map_from_definition(&def.input)?,
        output: field_map_from_definition(&def.output)?,
        next: def.next.as_ref().map(|t| t.to_vec()).unwrap_or_default(),
        routed_by_condition,
        timeout,
        options,
    })
}

fn condition_step(id: &str, def: &NodeDefinition) -> Result<ConditionStep> {
    let prev = non_empty(def.prev.as_deref())
        .ok_or_else(|| StepflowError::Config("condition step has no 'prev'".into()))?
        .to_string();
    let if_def = def
        .if_branch
        .as_ref()
        .ok_or_else(|| StepflowError::Config("condition step has no 'if' branch".into()))?;
    let if_branch = branch(if_def, "if")?;
    let elif_branches = def
        .elif_branches
        .iter()
        .enumerate()
        .map(|(i, b)| branch(b, &format!("elif[{i}]")))
        .collect::<Result<Vec<_>>>()?;
    Ok(ConditionStep {
        prev,
        router: ConditionRouter {
            step_id: id.to_string(),
            if_branch,
            elif_branches,
            else_targets: def.else_targets.as_ref().map(|t| t.to_vec()).unwrap_or_default(),
        },
    })
}

fn branch(def: &ConditionDefinition, label: &str) -> Result<ConditionBranch> {
    if def.condition.is_empty() {
        return Err(StepflowError::Config(format!(
            "'{label}' branch declares no condition clauses"
        )));
    }
    let clauses = def
        .condition
        .iter()
        .map(clause)
        .collect::<Result<Vec<_>>>()
        .map_err(|e| prefix_config(e, &format!("'{label}' branch")))?;
    Ok(ConditionBranch {
        logic: def.logic_operator,
        clauses,
        targets: def.next.as_ref().map(|t| t.to_vec()).unwrap_or_default(),
    })
}

fn clause(def: &ClauseDefinition) -> Result<ConditionClause> {
    let operator: Operator = def.operator.trim().parse()?;
    let operand_path = non_empty(Some(def.operand.as_str()))
        .ok_or_else(|| StepflowError::Config("condition clause has an empty operand".into()))?
        .to_string();
    let right = match def.source {
        Some(FieldSource::Reference) => match non_empty(def.reference.as_deref()) {
            Some(path) => Operand::Reference(path.to_string()),
            None => {
                return Err(StepflowError::Config(format!(
                    "clause on '{operand_path}' has source 'reference' but no reference path"
                )))
            }
        },
        Some(FieldSource::Input) => Operand::Literal(def.value.clone().unwrap_or(Value::Null)),
        None => match (non_empty(def.reference.as_deref()), &def.value) {
            (Some(_), Some(_)) => {
                return Err(StepflowError::Config(format!(
                    "clause on '{operand_path}' sets both value and reference; add 'source' to pick one"
                )))
            }
            (Some(path), None) => Operand::Reference(path.to_string()),
            (None, value) => Operand::Literal(value.clone().unwrap_or(Value::Null)),
        },
    };
    let right = match (right, def.op_type) {
        (Operand::Literal(v), Some(kind)) if !operator.is_unary() => Operand::Literal(kind.coerce(&v)?),
        (other, _) => other,
    };
    Ok(ConditionClause {
        operator,
        operand_path,
        right,
        op_kind: def.op_type,
    })
}

fn aggregation_step(id: &str, def: &NodeDefinition) -> Result<AggregationStep> {
    if def.aggregation.is_empty() {
        return Err(StepflowError::Config(
            "loop_aggregation step declares no aggregation keys".into(),
        ));
    }
    let aggregation = def
        .aggregation
        .iter()
        .map(|(key, a)| Ok((key.clone(), aggregation_spec(key, a)?)))
        .collect::<Result<IndexMap<_, _>>>()?;
    let next = def.next.as_ref().map(|t| t.to_vec()).unwrap_or_default();
    if next.is_empty() {
        return Err(StepflowError::Config(format!(
            "loop_aggregation step '{id}' must declare 'next'"
        )));
    }
    Ok(AggregationStep { aggregation, next })
}

fn aggregation_spec(key: &str, def: &AggregationDefinition) -> Result<AggregationSpec> {
    let reference = non_empty(Some(def.reference.as_str()))
        .ok_or_else(|| StepflowError::Config(format!("aggregation '{key}' has no reference")))?
        .to_string();
    Ok(AggregationSpec {
        reference,
        agg_type: def.agg_type.trim().parse()?,
        value_kind: def.value_type,
    })
}

fn prefix_config(err: StepflowError, context: &str) -> StepflowError {
    match err {
        StepflowError::Config(msg) => StepflowError::Config(format!("{context}: {msg}")),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub agent: AgentConfig,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowConfig {
    pub fn from_definition(def: &WorkflowDefinition) -> Result<Self> {
        let agent = AgentConfig::from_definition(&def.agent)?;
        let steps = def
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                StepDefinition::from_definition(i, node).map_err(|e| {
                    let label = node.id.clone().unwrap_or_else(|| format!("#{i}"));
                    match e {
                        StepflowError::Config(msg) if msg.starts_with("node #") => {
                            StepflowError::Config(msg)
                        }
                        other => prefix_config(other, &format!("step '{label}'")).with_step(&label),
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(agent = %agent.id, steps = steps.len(), "Workflow configuration built");
        Ok(WorkflowConfig { agent, steps })
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Condition steps whose `prev` is `id`, in declaration order.
    pub fn conditions_after<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a StepDefinition> {
        self.steps.iter().filter(move |s| match &s.kind {
            StepKind::Condition(c) => c.prev == id,
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Result<WorkflowConfig> {
        let def: WorkflowDefinition = serde_json::from_value(value).unwrap();
        WorkflowConfig::from_definition(&def)
    }

    #[test]
    fn plain_steps_keep_workload_type() {
        let cfg = config(json!({
            "agent": {"id": "a"},
            "nodes": [
                {"id": "p1", "type": "sdk", "next": ["p2", "p3"], "system_prompt": "hi"},
                {"id": "p2", "type": "rag"},
                {"id": "p3"}
            ]
        }))
        .unwrap();
        let StepKind::Plain(p1) = &cfg.steps[0].kind else { panic!("plain") };
        assert_eq!(p1.workload, "sdk");
        assert_eq!(p1.next, vec!["p2", "p3"]);
        assert_eq!(p1.options["system_prompt"], json!("hi"));
        let StepKind::Plain(p3) = &cfg.steps[2].kind else { panic!("plain") };
        assert_eq!(p3.workload, "base_agent");
        assert_eq!(cfg.steps[2].name, "p3");
    }

    #[test]
    fn missing_agent_id_gets_a_uuid() {
        let cfg = config(json!({"agent": {}, "nodes": []})).unwrap();
        assert!(uuid::Uuid::parse_str(&cfg.agent.id).is_ok());
    }

    #[test]
    fn field_sources() {
        let cfg = config(json!({
            "agent": {"id": "a"},
            "nodes": [{"id": "p1", "input": {
                "lit": {"source": "input", "value": "5", "value_type": "int"},
                "refd": {"source": "reference", "reference": "workflow_input.msg"},
                "implicit": {"reference": "workflow_input.n", "value_type": "int"},
                "unset": {"value_type": "list"}
            }}]
        }))
        .unwrap();
        let StepKind::Plain(p) = &cfg.steps[0].kind else { panic!("plain") };
        assert_eq!(p.input["lit"].value, ValueSource::Literal(json!(5)));
        assert_eq!(p.input["refd"].reference_path(), Some("workflow_input.msg"));
        assert_eq!(p.input["implicit"].reference_path(), Some("workflow_input.n"));
        assert_eq!(p.input["unset"].value, ValueSource::Unset);
    }

    #[test]
    fn reference_source_without_path_is_config_error() {
        let err = config(json!({
            "agent": {},
            "nodes": [{"id": "p1", "input": {"x": {"source": "reference"}}}]
        }))
        .unwrap_err();
        assert!(matches!(err, StepflowError::Config(ref m) if m.contains("step 'p1'")), "{err}");
    }

    #[test]
    fn value_and_reference_without_source_is_config_error() {
        let err = config(json!({
            "agent": {},
            "nodes": [{"id": "p1", "input": {"x": {"value": 1, "reference": "workflow_input.x"}}}]
        }))
        .unwrap_err();
        assert!(
            matches!(err, StepflowError::Config(ref m) if m.contains("both value and reference")),
            "{err}"
        );

        let err = config(json!({
            "agent": {},
            "nodes": [
                {"id": "p1", "next_type": "condition"},
                {"id": "c1", "type": "condition", "prev": "p1",
                 "if": {"logic_operator": "and", "condition": [
                     {"operator": "eq", "operand": "p1_output.tag", "value": "a",
                      "reference": "workflow_input.tag"}
                 ], "next": "p2"},
                 "else": "p2"},
                {"id": "p2"}
            ]
        }))
        .unwrap_err();
        assert!(
            matches!(err, StepflowError::Config(ref m) if m.contains("both value and reference")),
            "{err}"
        );
    }

    #[test]
    fn explicit_source_settles_value_and_reference() {
        let cfg = config(json!({
            "agent": {},
            "nodes": [{"id": "p1", "input": {
                "lit": {"source": "input", "value": 1, "value_type": "int",
                        "reference": "workflow_input.x"},
                "refd": {"source": "reference", "value": 1, "reference": "workflow_input.x"}
            }}]
        }))
        .unwrap();
        let StepKind::Plain(p) = &cfg.steps[0].kind else { panic!("plain") };
        assert_eq!(p.input["lit"].value, ValueSource::Literal(json!(1)));
        assert_eq!(p.input["refd"].reference_path(), Some("workflow_input.x"));
    }

    #[test]
    fn bad_literal_is_coercion_error() {
        let err = config(json!({
            "agent": {},
            "nodes": [{"id": "p1", "input": {"n": {"value": "many", "value_type": "int"}}}]
        }))
        .unwrap_err();
        match err {
            StepflowError::Coercion { field, step, .. } => {
                assert_eq!(field.as_deref(), Some("n"));
                assert_eq!(step.as_deref(), Some("p1"));
            }
            other => panic!("expected coercion error, got {other:?}"),
        }
    }

    #[test]
    fn condition_step_is_built() {
        let cfg = config(json!({
            "agent": {},
            "nodes": [
                {"id": "p1", "next_type": "condition"},
                {"id": "c1", "type": "condition", "prev": "p1",
                 "if": {"logic_operator": "and", "condition": [
                     {"operator": "gt", "operand": "p1_output.n", "value": "3", "op_type": "int"}
                 ], "next": "p2"},
                 "elif": [{"logic_operator": "or", "condition": [
                     {"operator": "eq", "operand": "p1_output.tag", "source": "reference",
                      "reference": "workflow_input.tag"}
                 ], "next": ["p3"]}],
                 "else": "p3"},
                {"id": "p2"},
                {"id": "p3"}
            ]
        }))
        .unwrap();
        let StepKind::Plain(p1) = &cfg.steps[0].kind else { panic!("plain") };
        assert!(p1.routed_by_condition);
        let StepKind::Condition(c) = &cfg.steps[1].kind else { panic!("condition") };
        assert_eq!(c.prev, "p1");
        assert_eq!(c.router.step_id, "c1");
        let first = &c.router.if_branch.clauses[0];
        assert_eq!(first.operator, Operator::Gt);
        assert_eq!(first.right, Operand::Literal(json!(3)));
        assert_eq!(
            c.router.elif_branches[0].clauses[0].right,
            Operand::Reference("workflow_input.tag".into())
        );
        assert_eq!(c.router.else_targets, vec!["p3"]);
        assert_eq!(cfg.conditions_after("p1").count(), 1);
        assert!(cfg.steps[1].direct_targets().is_empty());
    }

    #[test]
    fn condition_requires_prev_and_clauses() {
        let no_prev = config(json!({"agent": {}, "nodes": [
            {"id": "c", "type": "condition",
             "if": {"logic_operator": "and", "condition": [{"operator": "em", "operand": "a.b"}]}}
        ]}));
        assert!(matches!(no_prev, Err(StepflowError::Config(_))));

        let no_clause = config(json!({"agent": {}, "nodes": [
            {"id": "c", "type": "condition", "prev": "p",
             "if": {"logic_operator": "and", "condition": []}}
        ]}));
        let err = no_clause.unwrap_err();
        assert!(err.to_string().contains("no condition clauses"), "{err}");
    }

    #[test]
    fn unknown_operator_is_config_error() {
        let err = config(json!({"agent": {}, "nodes": [
            {"id": "c", "type": "condition", "prev": "p",
             "if": {"logic_operator": "and", "condition": [{"operator": "like", "operand": "a.b"}]}}
        ]}))
        .unwrap_err();
        assert!(err.to_string().contains("unknown condition operator 'like'"), "{err}");
    }

    #[test]
    fn aggregation_step_is_built() {
        let cfg = config(json!({"agent": {}, "nodes": [
            {"id": "l1", "type": "loop_aggregation", "next": "p1",
             "aggregation": {"total": {"reference": "p1_output.x", "agg_type": "sum"}}},
            {"id": "p1"}
        ]}))
        .unwrap();
        let StepKind::LoopAggregation(a) = &cfg.steps[0].kind else { panic!("aggregation") };
        assert_eq!(a.aggregation["total"].agg_type, AggregateType::Sum);
        assert_eq!(a.next, vec!["p1"]);
    }

    #[test]
    fn aggregation_requires_next_and_known_type() {
        let no_next = config(json!({"agent": {}, "nodes": [
            {"id": "l1", "type": "loop_aggregation",
             "aggregation": {"t": {"reference": "a.b", "agg_type": "sum"}}}
        ]}));
        assert!(no_next.unwrap_err().to_string().contains("must declare 'next'"));

        let bad_type = config(json!({"agent": {}, "nodes": [
            {"id": "l1", "type": "loop_aggregation", "next": "x",
             "aggregation": {"t": {"reference": "a.b", "agg_type": "median"}}}
        ]}));
        assert!(bad_type.unwrap_err().to_string().contains("unknown aggregation type 'median'"));
    }

    #[test]
    fn node_without_id_or_known_type_fails() {
        let err = config(json!({"agent": {}, "nodes": [{"type": "sdk"}]})).unwrap_err();
        assert_eq!(err.to_string(), "Workflow configuration invalid: node #0 has no id");
        let err = config(json!({"agent": {}, "nodes": [{"id": "x", "type": "robot"}]})).unwrap_err();
        assert!(err.to_string().contains("unknown node type 'robot'"));
    }

    #[test]
    fn step_timeout_is_read_from_options() {
        let cfg = config(json!({"agent": {}, "nodes": [{"id": "p", "timeout": 1.5}]})).unwrap();
        let StepKind::Plain(p) = &cfg.steps[0].kind else { panic!("plain") };
        assert_eq!(p.timeout, Some(Duration::from_millis(1500)));
        assert!(!p.options.contains_key("timeout"));
    }

    #[test]
    fn bare_reference_output() {
        let cfg = config(json!({"agent": {"output": "p1_output.result"}, "nodes": []})).unwrap();
        assert_eq!(cfg.agent.output, OutputSpec::Reference("p1_output.result".into()));
    }
}

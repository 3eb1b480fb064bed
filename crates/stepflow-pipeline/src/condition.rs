//! Condition evaluation and branch routing for condition steps.
//!
//! A condition step owns one `if` branch, any number of ordered `elif`
//! branches and an optional `else` target. Each branch is a list of clauses
//! joined by `and` or `or`:
//! ```text
//! Branch   ::= Clause ( ('and' | 'or') Clause )*
//! Clause   ::= OperandPath Operator RightHandSide
//! Operator ::= eq | ne | lt | gt | le | ge | ct | nc | sw | ew | em | nem
//! ```
//! Branches are tried in declaration order and the first match wins.
//! Clauses are evaluated lazily, so a clause after the short-circuit point
//! never resolves its operands.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use stepflow_types::{Record, Result, StepflowError, ValueKind};

pub use stepflow_definition::LogicOperator;

use crate::reference::resolve;

/// Comparison operator of a single clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    /// `ct`: left is contained in right.
    Contains,
    /// `nc`: left is not contained in right.
    NotContains,
    /// `sw`: textual left starts with right.
    StartsWith,
    /// `ew`: textual left ends with right.
    EndsWith,
    /// `em`: left is truthy.
    Truthy,
    /// `nem`: left is falsy.
    Falsy,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Lt => "lt",
            Operator::Gt => "gt",
            Operator::Le => "le",
            Operator::Ge => "ge",
            Operator::Contains => "ct",
            Operator::NotContains => "nc",
            Operator::StartsWith => "sw",
            Operator::EndsWith => "ew",
            Operator::Truthy => "em",
            Operator::Falsy => "nem",
        }
    }

    /// `em` and `nem` look at the left operand only.
    pub fn is_unary(self) -> bool {
        matches!(self, Operator::Truthy | Operator::Falsy)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = StepflowError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "lt" => Operator::Lt,
            "gt" => Operator::Gt,
            "le" => Operator::Le,
            "ge" => Operator::Ge,
            "ct" => Operator::Contains,
            "nc" => Operator::NotContains,
            "sw" => Operator::StartsWith,
            "ew" => Operator::EndsWith,
            "em" => Operator::Truthy,
            "nem" => Operator::Falsy,
            other => {
                return Err(StepflowError::Config(format!(
                    "unknown condition operator '{other}'"
                )))
            }
        })
    }
}

/// Right-hand side of a clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Reference(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionClause {
    pub operator: Operator,
    /// Reference path of the left operand.
    pub operand_path: String,
    pub right: Operand,
    /// Kind both operands are coerced to before comparison.
    pub op_kind: Option<ValueKind>,
}

impl ConditionClause {
    pub fn evaluate<R: Record + ?Sized>(&self, state: &R) -> Result<bool> {
        let mut left = resolve(&self.operand_path, state)?;
        if let Some(kind) = self.op_kind {
            left = kind.coerce(&left)?;
        }
        if self.operator.is_unary() {
            return evaluate(self.operator, &left, &Value::Null);
        }
        let right = match &self.right {
            Operand::Literal(v) => v.clone(),
            Operand::Reference(path) => {
                let v = resolve(path, state)?;
                match self.op_kind {
                    Some(kind) => kind.coerce(&v)?,
                    None => v,
                }
            }
        };
        evaluate(self.operator, &left, &right)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionBranch {
    pub logic: LogicOperator,
    pub clauses: Vec<ConditionClause>,
    pub targets: Vec<String>,
}

impl ConditionBranch {
    /// `and` stops at the first false clause, `or` at the first true one.
    pub fn matches<R: Record + ?Sized>(&self, state: &R) -> Result<bool> {
        match self.logic {
            LogicOperator::And => {
                for clause in &self.clauses {
                    if !clause.evaluate(state)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicOperator::Or => {
                for clause in &self.clauses {
                    if clause.evaluate(state)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// Which branch of a condition step was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// `if`, `elif[<n>]` or `else`.
    pub branch: String,
    /// Successor step ids; empty when the path ends here.
    pub targets: Vec<String>,
}

/// The branching function of one condition step.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionRouter {
    pub step_id: String,
    pub if_branch: ConditionBranch,
    pub elif_branches: Vec<ConditionBranch>,
    pub else_targets: Vec<String>,
}

impl ConditionRouter {
    pub fn route<R: Record + ?Sized>(&self, state: &R) -> Result<RouteDecision> {
        if self.if_branch.matches(state)? {
            return Ok(RouteDecision {
                branch: "if".into(),
                targets: self.if_branch.targets.clone(),
            });
        }
        for (i, branch) in self.elif_branches.iter().enumerate() {
            if branch.matches(state)? {
                return Ok(RouteDecision {
                    branch: format!("elif[{i}]"),
                    targets: branch.targets.clone(),
                });
            }
        }
        Ok(RouteDecision {
            branch: "else".into(),
            targets: self.else_targets.clone(),
        })
    }

    /// Every step id this router can send control to.
    pub fn all_targets(&self) -> impl Iterator<Item = &String> {
        self.if_branch
            .targets
            .iter()
            .chain(self.elif_branches.iter().flat_map(|b| b.targets.iter()))
            .chain(self.else_targets.iter())
    }
}

// ---------------------------------------------------------------------------
// Operator semantics
// ---------------------------------------------------------------------------

/// Apply `op` to the two operands. `right` is ignored by `em` and `nem`.
pub fn evaluate(op: Operator, left: &Value, right: &Value) -> Result<bool> {
    match op {
        Operator::Eq => Ok(loosely_equal(left, right)),
        Operator::Ne => Ok(!loosely_equal(left, right)),
        Operator::Lt => Ok(compare(left, right)? == Ordering::Less),
        Operator::Gt => Ok(compare(left, right)? == Ordering::Greater),
        Operator::Le => Ok(compare(left, right)? != Ordering::Greater),
        Operator::Ge => Ok(compare(left, right)? != Ordering::Less),
        Operator::Contains => contains(left, right, op),
        Operator::NotContains => contains(left, right, op).map(|found| !found),
        Operator::StartsWith => Ok(text_of(left).starts_with(text_operand(right, op)?)),
        Operator::EndsWith => Ok(text_of(left).ends_with(text_operand(right, op)?)),
        Operator::Truthy => Ok(is_truthy(left)),
        Operator::Falsy => Ok(!is_truthy(left)),
    }
}

/// `null`, `false`, zero, and empty strings, lists and maps are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Equality that treats `1` and `1.0` as the same number.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| loosely_equal(x, y))
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering> {
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => Some(i.cmp(&j)),
            _ => x
                .as_f64()
                .zip(y.as_f64())
                .and_then(|(f, g)| f.partial_cmp(&g)),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                match compare(x, y)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Some(xs.len().cmp(&ys.len()))
        }
        _ => None,
    };
    ordering.ok_or_else(|| {
        StepflowError::coercion(
            "ordered value",
            format!("cannot order {} against {}", type_name(a), type_name(b)),
        )
    })
}

fn contains(left: &Value, right: &Value, op: Operator) -> Result<bool> {
    match (left, right) {
        (Value::String(needle), Value::String(haystack)) => Ok(haystack.contains(needle.as_str())),
        (_, Value::Array(items)) => Ok(items.iter().any(|item| loosely_equal(item, left))),
        (Value::String(key), Value::Object(map)) => Ok(map.contains_key(key)),
        _ => Err(StepflowError::coercion(
            "container",
            format!(
                "'{op}' cannot look for a {} inside a {}",
                type_name(left),
                type_name(right)
            ),
        )),
    }
}

/// Textual form of a value: strings as-is, everything else as JSON text.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_operand(right: &Value, op: Operator) -> Result<&str> {
    right.as_str().ok_or_else(|| {
        StepflowError::coercion(
            ValueKind::Str,
            format!("right-hand side of '{op}' must be a string, got {}", type_name(right)),
        )
    })
}

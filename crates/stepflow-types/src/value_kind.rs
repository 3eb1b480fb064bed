//! Declared value kinds: defaults and coercion rules.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::{Result, StepflowError};

/// The kind a field, setting, or operand is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueKind {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "int")]
    Int,
    #[default]
    #[serde(rename = "str")]
    Str,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "dict", alias = "Dict")]
    Dict,
    #[serde(rename = "list", alias = "List")]
    List,
    #[serde(rename = "list[int]", alias = "List[int]")]
    ListInt,
    #[serde(rename = "list[str]", alias = "List[str]")]
    ListStr,
    #[serde(rename = "list[bool]", alias = "List[bool]")]
    ListBool,
    #[serde(rename = "list[float]", alias = "List[float]")]
    ListFloat,
    #[serde(rename = "list[dict]", alias = "List[dict]")]
    ListDict,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::None => "none",
            ValueKind::Any => "any",
            ValueKind::Int => "int",
            ValueKind::Str => "str",
            ValueKind::Bool => "bool",
            ValueKind::Float => "float",
            ValueKind::Dict => "dict",
            ValueKind::List => "list",
            ValueKind::ListInt => "list[int]",
            ValueKind::ListStr => "list[str]",
            ValueKind::ListBool => "list[bool]",
            ValueKind::ListFloat => "list[float]",
            ValueKind::ListDict => "list[dict]",
        };
        f.write_str(s)
    }
}

impl ValueKind {
    pub fn is_list(self) -> bool {
        self.element_kind().is_some() || self == ValueKind::List
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ValueKind::Int | ValueKind::Float)
    }

    /// Element kind of a typed list kind. `list` itself is untyped.
    pub fn element_kind(self) -> Option<ValueKind> {
        match self {
            ValueKind::ListInt => Some(ValueKind::Int),
            ValueKind::ListStr => Some(ValueKind::Str),
            ValueKind::ListBool => Some(ValueKind::Bool),
            ValueKind::ListFloat => Some(ValueKind::Float),
            ValueKind::ListDict => Some(ValueKind::Dict),
            _ => None,
        }
    }

    /// The value a field of this kind takes when it declares neither a
    /// literal nor a reference.
    pub fn default_value(self) -> Value {
        match self {
            ValueKind::None | ValueKind::Any => Value::Null,
            ValueKind::Int => Value::from(0),
            ValueKind::Str => Value::String(String::new()),
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Float => Value::from(0.0),
            ValueKind::Dict => Value::Object(serde_json::Map::new()),
            _ => Value::Array(Vec::new()),
        }
    }

    /// Convert `value` to this kind.
    ///
    /// `null` is never coerced; callers decide whether a null is acceptable.
    pub fn coerce(self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            ValueKind::None | ValueKind::Any => Ok(value.clone()),
            ValueKind::Int => coerce_int(value),
            ValueKind::Float => coerce_float(value),
            ValueKind::Bool => coerce_bool(value),
            ValueKind::Str => Ok(match value {
                Value::String(_) => value.clone(),
                other => Value::String(other.to_string()),
            }),
            ValueKind::Dict => match value {
                Value::Object(_) => Ok(value.clone()),
                other => Err(mismatch(self, other)),
            },
            ValueKind::List => match value {
                Value::Array(_) => Ok(value.clone()),
                other => Err(mismatch(self, other)),
            },
            list_kind => {
                let element = list_kind.element_kind().unwrap_or(ValueKind::Any);
                match value {
                    Value::Array(items) => items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| {
                            element.coerce(item).map_err(|e| {
                                StepflowError::coercion(list_kind, format!("element {i}: {e}"))
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                        .map(Value::Array),
                    other => Err(mismatch(self, other)),
                }
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(kind: ValueKind, value: &Value) -> StepflowError {
    StepflowError::coercion(kind, format!("unsupported {} value {value}", type_name(value)))
}

fn coerce_int(value: &Value) -> Result<Value> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        Value::Number(n) => {
            let f = n.as_f64().unwrap_or(f64::NAN);
            if f.is_finite() && f.trunc() >= i64::MIN as f64 && f.trunc() <= i64::MAX as f64 {
                Ok(Value::from(f.trunc() as i64))
            } else {
                Err(StepflowError::coercion(ValueKind::Int, format!("{f} is out of range")))
            }
        }
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| {
            StepflowError::coercion(ValueKind::Int, format!("'{s}' is not an integer"))
        }),
        other => Err(mismatch(ValueKind::Int, other)),
    }
}

fn coerce_float(value: &Value) -> Result<Value> {
    let f = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        other => return Err(mismatch(ValueKind::Float, other)),
    };
    f.and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| {
            StepflowError::coercion(ValueKind::Float, format!("{value} is not a finite number"))
        })
}

fn coerce_bool(value: &Value) -> Result<Value> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false))),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(StepflowError::coercion(
                ValueKind::Bool,
                format!("'{s}' is not a boolean"),
            )),
        },
        other => Err(mismatch(ValueKind::Bool, other)),
    }
}

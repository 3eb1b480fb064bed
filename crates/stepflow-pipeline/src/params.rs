//! Building step parameters from field declarations.

use indexmap::IndexSet;
use serde_json::{Map, Value};
use stepflow_types::{Record, Result, StepflowError};

use crate::config::{FieldMap, FieldSpec, PlainStep, ValueSource};
use crate::reference::{resolve, root};

/// Resolve every field of `fields` against `state`, in declaration order.
pub fn build_params<R: Record + ?Sized>(fields: &FieldMap, state: &R) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for (name, spec) in fields {
        let value = resolve_field(name, spec, state)?;
        params.insert(name.clone(), value);
    }
    Ok(params)
}

/// Resolve a single field: reference first, then literal, then the kind's
/// default. A `dict` field with a nested schema and no value of its own is
/// built from that schema.
pub fn resolve_field<R: Record + ?Sized>(name: &str, spec: &FieldSpec, state: &R) -> Result<Value> {
    match &spec.value {
        ValueSource::Reference(path) => {
            let value = resolve(path, state)?;
            if value.is_null() && (spec.required || !path.contains('.')) {
                return Err(StepflowError::reference(
                    path.as_str(),
                    format!("field '{name}' resolved to null"),
                ));
            }
            spec.value_kind.coerce(&value).map_err(|e| e.with_field(name))
        }
        ValueSource::Literal(value) => Ok(value.clone()),
        ValueSource::Unset => match &spec.schema {
            Some(nested) => build_params(nested, state).map(Value::Object),
            None => Ok(spec.value_kind.default_value()),
        },
    }
}

/// The state slots `fields` read, in first-use order, without duplicates.
pub fn dependencies(fields: &FieldMap) -> Vec<String> {
    let mut roots = IndexSet::new();
    collect_roots(fields, &mut roots);
    roots.into_iter().collect()
}

fn collect_roots(fields: &FieldMap, roots: &mut IndexSet<String>) {
    for spec in fields.values() {
        if let Some(slot) = spec.reference_path().and_then(root) {
            roots.insert(slot.to_string());
        }
        if let Some(nested) = &spec.schema {
            collect_roots(nested, roots);
        }
    }
}

impl PlainStep {
    pub fn input_dependencies(&self) -> Vec<String> {
        dependencies(&self.input)
    }

    pub fn output_dependencies(&self) -> Vec<String> {
        dependencies(&self.output)
    }
}

/// Check a caller's workflow input against the agent's declared input
/// fields.
///
/// Declared keys are coerced to their kind, missing optional keys take the
/// declared literal or the kind default, and a missing required key is a
/// coercion error. Undeclared keys pass through untouched.
pub fn coerce_input(fields: &FieldMap, input: Value) -> Result<Value> {
    let mut map = match input {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(StepflowError::coercion(
                "dict",
                format!("workflow input must be a mapping, got {other}"),
            ))
        }
    };
    for (name, spec) in fields {
        let supplied = map.get(name).filter(|v| !v.is_null()).cloned();
        let value = match supplied {
            Some(v) => spec.value_kind.coerce(&v).map_err(|e| e.with_field(name))?,
            None if spec.required => {
                return Err(StepflowError::coercion(
                    spec.value_kind,
                    "required workflow input is missing",
                )
                .with_field(name))
            }
            None => match &spec.value {
                ValueSource::Literal(v) => v.clone(),
                _ => spec.value_kind.default_value(),
            },
        };
        map.insert(name.clone(), value);
    }
    Ok(Value::Object(map))
}

//! Loop-aggregation accumulator.
//!
//! Each visit to a loop-aggregation step reads the step's previous record
//! from the run state, bumps its counter, appends the current value of every
//! configured reference, and recomputes the aggregates.
//!
//! An empty `mean` is `0.0`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use stepflow_types::{Record, Result, StepflowError, ValueKind};

use crate::config::{AggregateType, AggregationSpec, AggregationStep};
use crate::reference::resolve;
use crate::schema::output_slot;
use crate::state::StateUpdate;

/// The `{step}_output` slot of a loop-aggregation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub counter: u64,
    pub items: IndexMap<String, Vec<Value>>,
    pub aggregation: IndexMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    pub step_id: String,
    pub spec: AggregationStep,
}

impl Aggregator {
    pub fn new(step_id: impl Into<String>, spec: AggregationStep) -> Self {
        Aggregator {
            step_id: step_id.into(),
            spec,
        }
    }

    /// Fold the current state into the aggregate record and return the
    /// slot update.
    pub fn visit<R: Record + ?Sized>(&self, state: &R) -> Result<StateUpdate> {
        let slot = output_slot(&self.step_id);
        let mut record = match state.get(&slot) {
            None | Some(Value::Null) => AggregateRecord {
                counter: 0,
                items: self
                    .spec
                    .aggregation
                    .keys()
                    .map(|k| (k.clone(), Vec::new()))
                    .collect(),
                aggregation: IndexMap::new(),
            },
            Some(previous) => {
                let mut record: AggregateRecord = serde_json::from_value(previous.clone())
                    .map_err(|e| {
                        StepflowError::Other(format!("corrupt aggregate record in '{slot}': {e}"))
                    })?;
                record.counter += 1;
                record
            }
        };

        for (key, spec) in &self.spec.aggregation {
            let value = resolve(&spec.reference, state).map_err(|e| e.with_step(&self.step_id))?;
            let items = record.items.entry(key.clone()).or_default();
            if !value.is_null() {
                let value = match spec.value_kind {
                    Some(kind) => kind
                        .coerce(&value)
                        .map_err(|e| e.with_field(key).with_step(&self.step_id))?,
                    None => value,
                };
                items.push(value);
            }
            let aggregate = aggregate(spec, items)
                .map_err(|e| e.with_field(key).with_step(&self.step_id))?;
            record.aggregation.insert(key.clone(), aggregate);
        }

        tracing::debug!(
            step = %self.step_id,
            counter = record.counter,
            "Aggregation updated"
        );
        let mut update = StateUpdate::new();
        update.insert(slot, serde_json::to_value(record)?);
        Ok(update)
    }
}

/// Compute one aggregate over `items`.
pub fn aggregate(spec: &AggregationSpec, items: &[Value]) -> Result<Value> {
    match spec.agg_type {
        AggregateType::List => Ok(Value::Array(items.to_vec())),
        AggregateType::Sum => sum(items, spec.value_kind == Some(ValueKind::Float)),
        AggregateType::Mean => {
            if items.is_empty() {
                return Ok(Value::from(0.0));
            }
            let total = as_f64(&sum(items, true)?);
            float(total / items.len() as f64)
        }
    }
}

fn sum(items: &[Value], force_float: bool) -> Result<Value> {
    let mut int_total: Option<i64> = if force_float { None } else { Some(0) };
    let mut float_total = 0.0;
    for item in items {
        let Value::Number(n) = item else {
            return Err(StepflowError::coercion(
                "number",
                format!("cannot aggregate non-numeric item {item}"),
            ));
        };
        float_total += n.as_f64().unwrap_or(0.0);
        int_total = match (int_total, n.as_i64()) {
            (Some(acc), Some(i)) => Some(acc.checked_add(i).ok_or_else(|| {
                StepflowError::coercion(ValueKind::Int, "integer sum overflowed")
            })?),
            _ => None,
        };
    }
    match int_total {
        Some(total) => Ok(Value::from(total)),
        None => float(float_total),
    }
}

fn as_f64(value: &Value) -> f64 {
    value.as_f64().unwrap_or(0.0)
}

fn float(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| StepflowError::coercion(ValueKind::Float, format!("{f} is not finite")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggregator(entries: Vec<(&str, &str, AggregateType)>) -> Aggregator {
        let aggregation = entries
            .into_iter()
            .map(|(key, reference, agg_type)| {
                (
                    key.to_string(),
                    AggregationSpec {
                        reference: reference.into(),
                        agg_type,
                        value_kind: None,
                    },
                )
            })
            .collect();
        Aggregator::new(
            "L",
            AggregationStep {
                aggregation,
                next: vec!["p".into()],
            },
        )
    }

    fn record(update: &StateUpdate) -> AggregateRecord {
        serde_json::from_value(update["L_output"].clone()).unwrap()
    }

    #[test]
    fn three_visits_accumulate() {
        let agg = aggregator(vec![("total", "p_output.x", AggregateType::Sum)]);
        let mut state = json!({"p_output": null, "L_output": null});
        let mut counters = Vec::new();
        let mut totals = Vec::new();
        for x in [1, 2, 3] {
            state["p_output"] = json!({"x": x});
            let update = agg.visit(&state).unwrap();
            let rec = record(&update);
            counters.push(rec.counter);
            totals.push(rec.aggregation["total"].clone());
            state["L_output"] = update["L_output"].clone();
        }
        assert_eq!(counters, vec![0, 1, 2]);
        assert_eq!(totals, vec![json!(1), json!(3), json!(6)]);
    }

    #[test]
    fn mean_and_list() {
        let agg = aggregator(vec![
            ("avg", "p_output.x", AggregateType::Mean),
            ("all", "p_output.x", AggregateType::List),
        ]);
        let mut state = json!({"p_output": {"x": 1}, "L_output": null});
        let update = agg.visit(&state).unwrap();
        state["L_output"] = update["L_output"].clone();
        state["p_output"] = json!({"x": 2});
        let rec = record(&agg.visit(&state).unwrap());
        assert_eq!(rec.aggregation["avg"], json!(1.5));
        assert_eq!(rec.aggregation["all"], json!([1, 2]));
    }

    #[test]
    fn null_values_are_not_appended() {
        let agg = aggregator(vec![
            ("total", "p_output.x", AggregateType::Sum),
            ("avg", "p_output.x", AggregateType::Mean),
        ]);
        let state = json!({"p_output": {"x": null}, "L_output": null});
        let rec = record(&agg.visit(&state).unwrap());
        assert!(rec.items["total"].is_empty());
        assert_eq!(rec.aggregation["total"], json!(0));
        assert_eq!(rec.aggregation["avg"], json!(0.0));
    }

    #[test]
    fn mixed_numbers_sum_as_float() {
        let spec = AggregationSpec {
            reference: "x".into(),
            agg_type: AggregateType::Sum,
            value_kind: None,
        };
        assert_eq!(aggregate(&spec, &[json!(1), json!(0.5)]).unwrap(), json!(1.5));
        let float_spec = AggregationSpec {
            value_kind: Some(ValueKind::Float),
            ..spec.clone()
        };
        assert_eq!(aggregate(&float_spec, &[]).unwrap(), json!(0.0));
    }

    #[test]
    fn overflow_and_non_numeric_are_errors() {
        let spec = AggregationSpec {
            reference: "x".into(),
            agg_type: AggregateType::Sum,
            value_kind: None,
        };
        assert!(aggregate(&spec, &[json!(i64::MAX), json!(1)]).is_err());
        let err = aggregate(&spec, &[json!("three")]).unwrap_err();
        assert!(matches!(err, StepflowError::Coercion { .. }));
    }

    #[test]
    fn unresolvable_reference_names_the_step() {
        let agg = aggregator(vec![("total", "p_output.x", AggregateType::Sum)]);
        let err = agg.visit(&json!({"L_output": null})).unwrap_err();
        match err {
            StepflowError::Reference { step, .. } => assert_eq!(step.as_deref(), Some("L")),
            other => panic!("expected reference error, got {other:?}"),
        }
    }

    #[test]
    fn value_kind_coerces_items() {
        let mut agg = aggregator(vec![("total", "p_output.x", AggregateType::Sum)]);
        agg.spec.aggregation["total"].value_kind = Some(ValueKind::Int);
        let rec = record(&agg.visit(&json!({"p_output": {"x": "4"}, "L_output": null})).unwrap());
        assert_eq!(rec.aggregation["total"], json!(4));
    }
}

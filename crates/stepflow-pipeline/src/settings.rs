//! Run settings merged from the agent's `env` block and caller overrides.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use stepflow_definition::EnvDefinition;
use stepflow_types::{Result, ValueKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Setting {
    pub kind: ValueKind,
    pub value: Value,
    pub description: String,
    pub alias: Option<String>,
}

/// Typed settings lookup, by name or alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSettings {
    entries: IndexMap<String, Setting>,
}

impl RunSettings {
    /// Merge `overrides` into the `declared` settings.
    ///
    /// An override key matches a setting by name or alias; the name wins
    /// when both are present. Declared settings without an override keep
    /// their declared value, or their kind's default. Every value is
    /// coerced to the declared kind. Override keys matching nothing are
    /// added as untyped settings.
    pub fn merge(
        declared: &IndexMap<String, EnvDefinition>,
        overrides: &IndexMap<String, Value>,
    ) -> Result<Self> {
        let mut entries = IndexMap::new();
        let mut consumed: Vec<&str> = Vec::new();

        for (name, def) in declared {
            let by_name = overrides.get_key_value(name.as_str());
            let by_alias = def
                .alias
                .as_deref()
                .and_then(|a| overrides.get_key_value(a));
            let raw = match by_name.or(by_alias) {
                Some((key, v)) => {
                    consumed.push(key.as_str());
                    v.clone()
                }
                None => def
                    .value
                    .clone()
                    .unwrap_or_else(|| def.value_type.default_value()),
            };
            if let (Some(_), Some((alias_key, _))) = (by_name, by_alias) {
                consumed.push(alias_key.as_str());
            }
            let value = def.value_type.coerce(&raw).map_err(|e| e.with_field(name))?;
            entries.insert(
                name.clone(),
                Setting {
                    kind: def.value_type,
                    value,
                    description: def.description.clone(),
                    alias: def.alias.clone(),
                },
            );
        }

        for (key, value) in overrides {
            if consumed.contains(&key.as_str()) || entries.contains_key(key) {
                continue;
            }
            tracing::debug!(setting = %key, "Adding undeclared setting");
            entries.insert(
                key.clone(),
                Setting {
                    kind: ValueKind::Any,
                    value: value.clone(),
                    description: String::new(),
                    alias: None,
                },
            );
        }

        Ok(RunSettings { entries })
    }

    pub fn setting(&self, key: &str) -> Option<&Setting> {
        self.entries.get(key).or_else(|| {
            self.entries
                .values()
                .find(|s| s.alias.as_deref() == Some(key))
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.setting(key).map(|s| &s.value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Setting)> {
        self.entries.iter()
    }
}

/// Overrides for `declared` taken from process environment variables,
/// matched by setting name or alias.
pub fn process_overrides(declared: &IndexMap<String, EnvDefinition>) -> IndexMap<String, Value> {
    let mut overrides = IndexMap::new();
    for (name, def) in declared {
        let found = std::env::var(name)
            .ok()
            .or_else(|| def.alias.as_deref().and_then(|a| std::env::var(a).ok()));
        if let Some(raw) = found {
            overrides.insert(name.clone(), Value::String(raw));
        }
    }
    overrides
}

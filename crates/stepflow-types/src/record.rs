//! Uniform keyed access over field-bearing and mapping-like values.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Anything a reference path segment can be looked up in.
///
/// Typed containers (such as the run state) answer with their declared
/// fields; open maps answer with their keys. A declared field that holds no
/// value yet answers `Some(&Value::Null)`, an unknown key answers `None`.
pub trait Record {
    fn get(&self, key: &str) -> Option<&Value>;

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

impl Record for Map<String, Value> {
    fn get(&self, key: &str) -> Option<&Value> {
        Map::get(self, key)
    }
}

impl Record for HashMap<String, Value> {
    fn get(&self, key: &str) -> Option<&Value> {
        HashMap::get(self, key)
    }
}

impl Record for Value {
    /// Objects are looked up by key, arrays by decimal position.
    fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }
}

// Dynamic data model
//
// Workflow data, trigger payloads and step outputs are open string-keyed
// maps of JSON values. The accessors here keep the dynamic model behind
// typed fallibles so callers outside the handler boundary never pattern
// match on raw JSON.

use serde_json::Value;
use std::collections::HashMap;

/// String-keyed JSON map used for instance data, trigger payloads,
/// step outputs and pipeline metadata.
pub type DataMap = HashMap<String, Value>;

/// Typed accessors and merge semantics over a [`DataMap`]
pub trait DataMapExt {
    fn get_str(&self, key: &str) -> Option<&str>;
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_i64(&self, key: &str) -> Option<i64>;
    fn get_f64(&self, key: &str) -> Option<f64>;

    /// Merge `other` into self; keys from `other` overwrite existing keys.
    fn merge_from(&mut self, other: &DataMap);

    /// Descend into nested objects along a dotted path.
    fn lookup_path(&self, path: &str) -> Option<&Value>;
}

impl DataMapExt for DataMap {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    fn merge_from(&mut self, other: &DataMap) {
        for (k, v) in other {
            self.insert(k.clone(), v.clone());
        }
    }

    fn lookup_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

/// Truthiness used by transition guards: null and absent are false,
/// numbers are false only at zero, strings are false only when empty.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Convert a JSON object into a [`DataMap`]; non-objects produce an empty map.
pub fn object_to_map(value: &Value) -> DataMap {
    match value.as_object() {
        Some(obj) => obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        None => DataMap::new(),
    }
}

/// Convert a [`DataMap`] into a JSON object value.
pub fn map_to_object(map: &DataMap) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

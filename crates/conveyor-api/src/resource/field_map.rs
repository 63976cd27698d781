// Field mapping
//
// External event sources disagree on field names; the mapping is a lens
// between a small canonical field set and ordered fallback keys in the
// resource's open data map. Reads take the first fallback key present,
// writes go to whichever fallback key already holds the value (the primary
// key otherwise) so round-trips never fork a second copy.

use serde_json::Value;
use std::collections::HashMap;

use conveyor_core::DataMap;

#[derive(Debug, Clone)]
pub struct FieldMap {
    map: HashMap<String, Vec<String>>,
}

impl FieldMap {
    /// Obvious synonym defaults, overridable per handler block.
    pub fn with_defaults(overrides: HashMap<String, Vec<String>>) -> Self {
        let mut map: HashMap<String, Vec<String>> = [
            ("id", vec!["id", "_id"]),
            ("state", vec!["state", "status"]),
            ("lastUpdate", vec!["lastUpdate", "last_update", "updatedAt"]),
            ("messages", vec!["messages", "history"]),
            ("message", vec!["message", "text", "body"]),
            ("tags", vec!["tags", "labels"]),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
        .collect();

        for (logical, keys) in overrides {
            map.insert(logical, keys);
        }
        Self { map }
    }

    /// Read a logical field: first fallback key present in the data wins.
    /// Unmapped logical names read and write themselves.
    pub fn read<'a>(&self, data: &'a DataMap, logical: &str) -> Option<&'a Value> {
        match self.map.get(logical) {
            Some(keys) => keys.iter().find_map(|key| data.get(key)),
            None => data.get(logical),
        }
    }

    /// Write a logical field to the key that already holds it, or to the
    /// primary (first) fallback key.
    pub fn write(&self, data: &mut DataMap, logical: &str, value: Value) {
        let key = match self.map.get(logical) {
            Some(keys) => keys
                .iter()
                .find(|key| data.contains_key(*key))
                .unwrap_or(&keys[0])
                .clone(),
            None => logical.to_string(),
        };
        data.insert(key, value);
    }

    /// The canonical storage key for a logical field.
    pub fn primary_key<'a>(&'a self, logical: &'a str) -> &'a str {
        self.map
            .get(logical)
            .and_then(|keys| keys.first())
            .map(|s| s.as_str())
            .unwrap_or(logical)
    }
}

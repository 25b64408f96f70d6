//! Query and mutation keys.
//!
//! A key is an ordered JSON value. Two keys are equal iff their canonical
//! serialization is equal; object property order never matters. The
//! canonical serialization is the key's *hash*, used as the cache map key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An ordered, JSON-serializable key identifying a query or mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Value);

impl QueryKey {
    /// Builds a key from any serializable value.
    pub fn new(value: impl Serialize) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self)
    }

    /// The raw JSON value of this key.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    /// Canonical serialization used as the cache map key.
    #[must_use]
    pub fn hash(&self) -> String {
        hash_value(&self.0)
    }

    /// Returns `true` if `prefix` matches the start of this key.
    ///
    /// Arrays match element-wise by index, objects match when every
    /// property of the prefix matches.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        partial_match(&self.0, &prefix.0)
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self(Value::Array(vec![Value::String(value.to_string())]))
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self(Value::Array(vec![Value::String(value)]))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash())
    }
}

/// Canonical, property-order-independent serialization of a JSON value.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn partial_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(a), Value::Array(b)) => {
            b.len() <= a.len() && a.iter().zip(b).all(|(a, b)| partial_match(a, b))
        }
        (Value::Object(a), Value::Object(b)) => b
            .iter()
            .all(|(k, bv)| a.get(k).is_some_and(|av| partial_match(av, bv))),
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_property_order() {
        let a = QueryKey::from(json!(["todos", {"page": 1, "status": "done"}]));
        let b = QueryKey::from(json!(["todos", {"status": "done", "page": 1}]));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_respects_array_order() {
        let a = QueryKey::from(json!(["a", "b"]));
        let b = QueryKey::from(json!(["b", "a"]));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_prefix_match() {
        let key = QueryKey::from(json!(["todos", {"page": 1, "status": "done"}]));
        assert!(key.starts_with(&QueryKey::from("todos")));
        assert!(key.starts_with(&QueryKey::from(json!(["todos", {"page": 1}]))));
        assert!(!key.starts_with(&QueryKey::from(json!(["todos", {"page": 2}]))));
        assert!(!key.starts_with(&QueryKey::from("posts")));
        assert!(!QueryKey::from("todos").starts_with(&key));
    }

    #[test]
    fn test_string_key_is_single_element_array() {
        let key = QueryKey::from("user-123");
        assert_eq!(key.as_value(), &json!(["user-123"]));
        assert_eq!(key.to_string(), "[\"user-123\"]");
    }
}

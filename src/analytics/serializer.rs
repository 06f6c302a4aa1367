//! Cycle-safe payload serializer
//!
//! Payloads handed to analytics may share nodes (`Payload::Shared`) and
//! therefore contain reference cycles. Serialization walks the graph with the
//! set of shared nodes on the current path and a depth counter: a cycle is an
//! error, excessive depth is truncated with a marker.

use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const TRUNCATED_MARKER: &str = "[truncated]";

/// Arbitrary nested payload, possibly with shared (and cyclic) nodes
#[derive(Debug, Clone)]
pub enum Payload {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    List(Vec<Payload>),
    Map(Vec<(String, Payload)>),
    Shared(Arc<Mutex<Payload>>),
}

impl Payload {
    pub fn shared(inner: Payload) -> Self {
        Payload::Shared(Arc::new(Mutex::new(inner)))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::Text(s),
            Value::Array(items) => Payload::List(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => Payload::Map(map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect()),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    #[error("circular reference in payload")]
    Cycle,

    /// A shared node's lock was poisoned
    #[error("poisoned payload node")]
    Poisoned,
}

/// Serialize to JSON, truncating below `max_depth` levels
pub fn safe_serialize(payload: &Payload, max_depth: usize) -> Result<Value, SerializeError> {
    let mut path = HashSet::new();
    walk(payload, 0, max_depth, &mut path)
}

fn walk(
    payload: &Payload,
    depth: usize,
    max_depth: usize,
    path: &mut HashSet<usize>,
) -> Result<Value, SerializeError> {
    if depth > max_depth {
        return Ok(Value::String(TRUNCATED_MARKER.to_string()));
    }

    match payload {
        Payload::Null => Ok(Value::Null),
        Payload::Bool(b) => Ok(Value::Bool(*b)),
        Payload::Number(n) => Ok(Value::Number(n.clone())),
        Payload::Text(s) => Ok(Value::String(s.clone())),
        Payload::List(items) => items
            .iter()
            .map(|item| walk(item, depth + 1, max_depth, path))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Payload::Map(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), walk(value, depth + 1, max_depth, path)?);
            }
            Ok(Value::Object(map))
        }
        Payload::Shared(node) => {
            let id = Arc::as_ptr(node) as usize;
            // Checked before locking: re-locking an ancestor would deadlock
            if !path.insert(id) {
                return Err(SerializeError::Cycle);
            }
            let result = match node.lock() {
                Ok(inner) => walk(&inner, depth, max_depth, path),
                Err(_) => Err(SerializeError::Poisoned),
            };
            path.remove(&id);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_payload() {
        let payload = Payload::from(json!({"merchant": "costco", "amounts": [1, 2.5], "x": null}));
        let value = safe_serialize(&payload, 10).unwrap();
        assert_eq!(value, json!({"merchant": "costco", "amounts": [1, 2.5], "x": null}));
    }

    #[test]
    fn test_integers_stay_integers() {
        let payload = Payload::from(json!({"count": 3, "offset": -2, "big": u64::MAX}));
        let value = safe_serialize(&payload, 10).unwrap();
        assert!(value["count"].is_u64());
        assert_eq!(value["count"].as_u64(), Some(3));
        assert_eq!(value["offset"].as_i64(), Some(-2));
        assert_eq!(value["big"].as_u64(), Some(u64::MAX));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(SerializeError::Cycle.to_string(), "circular reference in payload");
        assert_eq!(SerializeError::Poisoned.to_string(), "poisoned payload node");
    }

    #[test]
    fn test_cycle_is_detected() {
        let node = Payload::shared(Payload::Map(Vec::new()));
        if let Payload::Shared(inner) = &node {
            *inner.lock().unwrap() = Payload::Map(vec![("self".to_string(), node.clone())]);
        }
        assert_eq!(safe_serialize(&node, 10), Err(SerializeError::Cycle));
    }

    #[test]
    fn test_shared_but_acyclic_is_fine() {
        let leaf = Payload::shared(Payload::Text("costco".into()));
        let payload = Payload::List(vec![leaf.clone(), leaf]);
        assert_eq!(safe_serialize(&payload, 10).unwrap(), json!(["costco", "costco"]));
    }

    #[test]
    fn test_depth_cap_truncates() {
        let mut payload = Payload::Text("bottom".into());
        for _ in 0..15 {
            payload = Payload::List(vec![payload]);
        }
        let value = safe_serialize(&payload, 3).unwrap();
        assert_eq!(value, json!([[[[TRUNCATED_MARKER]]]]));
    }
}

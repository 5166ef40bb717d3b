//! Values exchanged with plugins.
//!
//! Plugin configuration and metadata are arbitrary nested trees. On the wire
//! they are plain JSON; in Rust they are the closed [`Value`] union so every
//! consumer handles each shape explicitly. JSON `null` has no counterpart and
//! is rejected when converting in.

use crate::error::{CertdeckError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String-keyed map of values (plugin config, plugin metadata).
pub type ValueMap = BTreeMap<String, Value>;

/// A plugin value: string, number, boolean, list or map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Convert from an arbitrary JSON value, rejecting `null` anywhere in the tree.
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        Self::from_json_at(json, "$")
    }

    fn from_json_at(json: serde_json::Value, at: &str) -> Result<Self> {
        Ok(match json {
            serde_json::Value::Null => {
                return Err(CertdeckError::Protocol {
                    message: format!("null is not a valid plugin value (at {at})"),
                })
            }
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| Self::from_json_at(item, &format!("{at}[{i}]")))
                    .collect::<Result<_>>()?,
            ),
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| {
                        let child = Self::from_json_at(v, &format!("{at}.{k}"))?;
                        Ok((k, child))
                    })
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

/// Convert a JSON object into a [`ValueMap`].
pub fn map_from_json(json: serde_json::Value) -> Result<ValueMap> {
    match Value::from_json(json)? {
        Value::Map(map) => Ok(map),
        other => Err(CertdeckError::Protocol {
            message: format!("expected a map, got {}", other.kind()),
        }),
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number((n as u64).into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_tree_from_json() {
        let value = Value::from_json(json!({
            "name": "acme",
            "retries": 3,
            "ratio": 0.5,
            "staging": false,
            "tags": ["a", {"deep": [1, 2]}]
        }))
        .unwrap();

        let map = value.as_map().unwrap();
        assert_eq!(map["name"].as_str(), Some("acme"));
        assert_eq!(map["retries"].as_i64(), Some(3));
        assert_eq!(map["ratio"].as_f64(), Some(0.5));
        assert_eq!(map["staging"].as_bool(), Some(false));
        let tags = map["tags"].as_list().unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[1].as_map().unwrap()["deep"].kind(), "list");
    }

    #[test]
    fn test_null_is_rejected_with_location() {
        let err = Value::from_json(json!({"a": [1, null]})).unwrap_err();
        assert!(err.to_string().contains("$.a[1]"), "{err}");
    }

    #[test]
    fn test_untagged_serde_matches_plain_json() {
        let parsed: Value = serde_json::from_str(r#"{"k": [true, 7, "x"]}"#).unwrap();
        let expected = Value::Map(ValueMap::from([(
            "k".to_string(),
            Value::List(vec![true.into(), 7i64.into(), "x".into()]),
        )]));
        assert_eq!(parsed, expected);
        assert_eq!(
            serde_json::to_value(&parsed).unwrap(),
            json!({"k": [true, 7, "x"]})
        );
    }

    #[test]
    fn test_map_from_json_requires_object() {
        assert!(map_from_json(json!([1])).is_err());
        assert!(map_from_json(json!({})).unwrap().is_empty());
    }
}

//! Dynamic values held in shared state, task payloads and algorithm parameters

use crate::error::{SwarmError, SwarmResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tagged value with arbitrary nesting
///
/// Serializes untagged, so a value round-trips through JSON as the plain
/// JSON shape (`null`, `true`, `3`, `2.5`, `"x"`, `[..]`, `{..}`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Absent value
    #[default]
    Null,
    /// Boolean value
    Boolean(bool),
    /// Integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Ordered sequence of values
    Sequence(Vec<StateValue>),
    /// Nested map with deterministic key order
    Map(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Build a map value from key/value pairs
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<StateValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        StateValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StateValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Float(f) => Some(*f),
            StateValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, StateValue>> {
        match self {
            StateValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key when this value is a map
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Whether every float inside the value is finite
    ///
    /// JSON has no NaN or infinity, so non-finite floats would come back as
    /// `null` from a checkpoint or record.
    pub fn is_finite(&self) -> bool {
        match self {
            StateValue::Float(f) => f.is_finite(),
            StateValue::Sequence(items) => items.iter().all(StateValue::is_finite),
            StateValue::Map(map) => map.values().all(StateValue::is_finite),
            _ => true,
        }
    }

    /// Reject values that cannot round-trip through JSON
    pub fn ensure_finite(&self, key: &str) -> SwarmResult<()> {
        if self.is_finite() {
            Ok(())
        } else {
            Err(SwarmError::InvalidValue {
                key: key.to_string(),
                reason: "NaN and infinite floats are not storable".to_string(),
            })
        }
    }

    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Boolean(_) => "boolean",
            StateValue::Integer(_) => "integer",
            StateValue::Float(_) => "float",
            StateValue::String(_) => "string",
            StateValue::Sequence(_) => "sequence",
            StateValue::Map(_) => "map",
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Boolean(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Integer(value)
    }
}

impl From<i32> for StateValue {
    fn from(value: i32) -> Self {
        StateValue::Integer(value.into())
    }
}

impl From<u32> for StateValue {
    fn from(value: u32) -> Self {
        StateValue::Integer(value.into())
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::String(value)
    }
}

impl<T: Into<StateValue>> From<Vec<T>> for StateValue {
    fn from(values: Vec<T>) -> Self {
        StateValue::Sequence(values.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, StateValue>> for StateValue {
    fn from(map: BTreeMap<String, StateValue>) -> Self {
        StateValue::Map(map)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(StateValue::Null, Into::into)
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StateValue::Null,
            serde_json::Value::Bool(b) => StateValue::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    StateValue::Integer(i)
                } else {
                    // u64 above i64::MAX lands here too
                    StateValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => StateValue::String(s),
            serde_json::Value::Array(arr) => {
                StateValue::Sequence(arr.into_iter().map(StateValue::from).collect())
            }
            serde_json::Value::Object(obj) => StateValue::Map(
                obj.into_iter()
                    .map(|(k, v)| (k, StateValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<StateValue> for serde_json::Value {
    fn from(value: StateValue) -> Self {
        match value {
            StateValue::Null => serde_json::Value::Null,
            StateValue::Boolean(b) => serde_json::Value::Bool(b),
            StateValue::Integer(i) => serde_json::Value::from(i),
            StateValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            StateValue::String(s) => serde_json::Value::String(s),
            StateValue::Sequence(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            StateValue::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_value_from_json() {
        let value = StateValue::from(json!({
            "type": "optimize",
            "bounds": [[0.0, 1.0], [-5, 5]],
            "iterations": 20,
            "enabled": true,
            "note": null,
        }));

        assert_eq!(value.get("type").and_then(StateValue::as_str), Some("optimize"));
        assert_eq!(value.get("iterations").and_then(StateValue::as_i64), Some(20));
        assert_eq!(value.get("enabled").and_then(StateValue::as_bool), Some(true));
        assert!(value.get("note").map(StateValue::is_null).unwrap_or(false));

        let bounds = value.get("bounds").and_then(StateValue::as_sequence).unwrap();
        assert_eq!(bounds.len(), 2);
        assert_eq!(bounds[1].as_sequence().unwrap()[0].as_f64(), Some(-5.0));
    }

    #[test]
    fn test_serializes_as_plain_json() {
        let value = StateValue::map([
            ("a", StateValue::from(1)),
            ("b", StateValue::from(2.5)),
            ("c", StateValue::from(vec!["x", "y"])),
        ]);
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"{"a":1,"b":2.5,"c":["x","y"]}"#);

        let back: StateValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_whole_float_stays_float() {
        let back: StateValue = serde_json::from_str("2.0").unwrap();
        assert_eq!(back, StateValue::Float(2.0));
        let back: StateValue = serde_json::from_str("2").unwrap();
        assert_eq!(back, StateValue::Integer(2));
    }

    #[test]
    fn test_non_finite_floats_rejected() {
        assert!(StateValue::from(1.5).ensure_finite("x").is_ok());
        let nested = StateValue::map([("inner", StateValue::from(vec![1.0, f64::NAN]))]);
        assert!(!nested.is_finite());
        assert!(matches!(
            nested.ensure_finite("weights"),
            Err(SwarmError::InvalidValue { key, .. }) if key == "weights"
        ));
        assert!(StateValue::from(f64::NEG_INFINITY).ensure_finite("x").is_err());
    }
}

//! Runtime values flowing through every backend

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number};
use std::fmt;

/// Object property table; iteration follows insertion order
pub type Object = IndexMap<String, Value>;

/// JSON-shaped runtime value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value (the result of an empty program or a `void` call)
    #[default]
    Undefined,
    /// JSON `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number; all JSON numbers are carried as `f64`
    Number(f64),
    /// UTF-8 string
    String(String),
    /// Heterogeneous array
    Array(Vec<Value>),
    /// Object with ordered properties
    Object(Object),
}

impl Value {
    /// Short kind name used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Numeric payload, if any
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(num) => Some(*num),
            _ => None,
        }
    }

    /// String payload, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// Boolean payload, if any
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(flag) => Some(*flag),
            _ => None,
        }
    }

    /// Array payload, if any
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Object payload, if any
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Whether this is [`Value::Undefined`]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Convert into a `serde_json` value. `Undefined` renders as `null`;
    /// non-finite numbers also collapse to `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(flag) => serde_json::Value::Bool(*flag),
            Value::Number(num) => number_to_json(*num),
            Value::String(text) => serde_json::Value::String(text.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(object) => {
                let map: Map<String, serde_json::Value> = object
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect();
                serde_json::Value::Object(map)
            }
        }
    }

    /// Reconstruct a value from `serde_json`
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(flag) => Value::Bool(*flag),
            serde_json::Value::Number(num) => Value::Number(num.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(text) => Value::String(text.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), Value::from_json(value)))
                    .collect(),
            ),
        }
    }
}

/// Integral numbers render without a fractional part so `29.0` prints as `29`
pub(crate) fn number_to_json(num: f64) -> serde_json::Value {
    if num.fract() == 0.0 && num.is_finite() && num.abs() < 9.007_199_254_740_992e15 {
        serde_json::Value::Number(Number::from(num as i64))
    } else {
        Number::from_f64(num)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::from_json(&value)
    }
}

impl From<f64> for Value {
    fn from(num: f64) -> Self {
        Value::Number(num)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Bool(flag)
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::String(text)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::String(text.to_string())
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion_preserves_property_order() {
        let source = json!({"zeta": 1, "alpha": [true, null, "x"], "mid": {"b": 2, "a": 1}});
        let value = Value::from_json(&source);
        let keys: Vec<&str> = value
            .as_object()
            .expect("object")
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(value.to_json().to_string(), source.to_string());
    }

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(Value::Number(29.0).to_string(), "29");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Undefined.to_string(), "undefined");
    }

    #[test]
    fn undefined_serializes_as_null() {
        let text = serde_json::to_string(&Value::Array(vec![Value::Undefined])).unwrap();
        assert_eq!(text, "[null]");
    }
}

//! Values carried by device nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed node value.
///
/// `Null` is a meaningful device value (e.g. "no setpoint"), distinct from the
/// absence of a value which is modelled with `Option<NodeValue>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeValue {
    /// Explicit null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Numeric value
    Number(f64),
    /// Text or enum case identifier
    Text(String),
}

impl NodeValue {
    /// Convert to a rhai value for expression scopes.
    pub fn to_dynamic(&self) -> rhai::Dynamic {
        match self {
            NodeValue::Null => rhai::Dynamic::UNIT,
            NodeValue::Bool(value) => rhai::Dynamic::from_bool(*value),
            NodeValue::Number(value) => rhai::Dynamic::from_float(*value),
            NodeValue::Text(value) => rhai::Dynamic::from(value.clone()),
        }
    }

    /// Convert a rhai value produced by an expression.
    ///
    /// Returns `None` for values that cannot be written to a node.
    pub fn from_dynamic(value: &rhai::Dynamic) -> Option<Self> {
        if value.is_unit() {
            Some(NodeValue::Null)
        } else if let Ok(flag) = value.as_bool() {
            Some(NodeValue::Bool(flag))
        } else if let Ok(number) = value.as_float() {
            Some(NodeValue::Number(number))
        } else if let Ok(number) = value.as_int() {
            Some(NodeValue::Number(number as f64))
        } else if value.is_string() {
            Some(NodeValue::Text(value.clone().into_string().ok()?))
        } else {
            None
        }
    }

    /// Convert a YAML scalar from a protocol document.
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<Self> {
        match value {
            serde_yaml::Value::Null => Some(NodeValue::Null),
            serde_yaml::Value::Bool(flag) => Some(NodeValue::Bool(*flag)),
            serde_yaml::Value::Number(number) => number.as_f64().map(NodeValue::Number),
            serde_yaml::Value::String(text) => Some(NodeValue::Text(text.clone())),
            _ => None,
        }
    }

    /// Numeric view of the value, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NodeValue::Number(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::Null => write!(f, "null"),
            NodeValue::Bool(value) => write!(f, "{value}"),
            NodeValue::Number(value) => write!(f, "{value}"),
            NodeValue::Text(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<bool> for NodeValue {
    fn from(value: bool) -> Self {
        NodeValue::Bool(value)
    }
}

impl From<f64> for NodeValue {
    fn from(value: f64) -> Self {
        NodeValue::Number(value)
    }
}

impl From<&str> for NodeValue {
    fn from(value: &str) -> Self {
        NodeValue::Text(value.to_string())
    }
}

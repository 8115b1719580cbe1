// Variable Values
// Scalar values bound to variables and produced by expressions

use serde::{Deserialize, Serialize};
use std::fmt;

/// A resolved scalar value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Render for substitution; integral numbers print without a fraction
    pub fn as_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
        }
    }

    /// Convert a YAML scalar. Sequences and mappings are not scalars.
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<Value> {
        match value {
            serde_yaml::Value::Null => Some(Value::Null),
            serde_yaml::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_yaml::Value::Number(n) => n.as_f64().map(Value::Number),
            serde_yaml::Value::String(s) => Some(Value::String(s.clone())),
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(&tagged.value),
            serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => None,
        }
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        (n as i64).to_string()
    } else {
        n.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_is_truthy() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Number(1.0).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
    }

    #[test]
    fn test_value_as_string() {
        assert_eq!(Value::Null.as_string(), "");
        assert_eq!(Value::Number(32.0).as_string(), "32");
        assert_eq!(Value::Number(2.5).as_string(), "2.5");
        assert_eq!(Value::Number(-4.0).as_string(), "-4");
        assert_eq!(Value::from("x").as_string(), "x");
    }

    #[test]
    fn test_from_yaml_scalars() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("[1, two, true, ~]").unwrap();
        let items: Vec<_> = yaml
            .as_sequence()
            .unwrap()
            .iter()
            .map(Value::from_yaml)
            .collect();
        assert_eq!(
            items,
            vec![
                Some(Value::Number(1.0)),
                Some(Value::from("two")),
                Some(Value::Bool(true)),
                Some(Value::Null)
            ]
        );

        let seq: serde_yaml::Value = serde_yaml::from_str("[1]").unwrap();
        assert_eq!(Value::from_yaml(&seq), None);
    }

    #[test]
    fn test_value_json_is_untagged() {
        let json = serde_json::to_string(&vec![Value::Number(16.0), Value::from("a")]).unwrap();
        assert_eq!(json, "[16.0,\"a\"]");
    }
}

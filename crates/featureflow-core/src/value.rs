//! Dynamically-typed value used for event parameters and `in`/`not_in`
//! expected values (spec §9 Design Notes: "Dynamic JSON values").
//!
//! String-form projection happens inside the comparator at compare
//! time, not here at parse time, so numeric comparisons stay precise
//! (a `Number(9.99)` compared against the string `"9.99"` must not lose
//! precision by round-tripping through `f64::to_string` prematurely —
//! callers that need the string form call [`Value::as_str_form`] lazily).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Number;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Number(Number),
    Bool(bool),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Project to the string form used by the comparator for
    /// non-numeric operators and as the lexicographic fallback.
    pub fn as_str_form(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Array(items) => items
                .iter()
                .map(Value::as_str_form)
                .collect::<Vec<_>>()
                .join(","),
            Value::Map(_) => self.to_json_string(),
        }
    }

    /// Attempt a finite numeric projection; used by ordering operators
    /// before falling back to lexicographic comparison.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            Value::Bool(_) | Value::Array(_) | Value::Map(_) => None,
        }
    }

    /// Expand to a flat list of element string-forms for `in`/`not_in`
    /// membership tests: an `Array` expands element-wise, anything else
    /// is treated as a comma-separated string per spec §4.1.
    pub fn as_membership_list(&self) -> Vec<String> {
        match self {
            Value::Array(items) => items.iter().map(Value::as_str_form).collect(),
            other => other
                .as_str_form()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str_form())
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

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::String(String::new()),
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_string_preserves_precision() {
        let v = Value::String("9.99".to_string());
        assert_eq!(v.as_f64(), Some(9.99));
        assert_eq!(v.as_str_form(), "9.99");
    }

    #[test]
    fn array_expands_membership_list() {
        let v = Value::Array(vec![Value::from("beta"), Value::from("admin")]);
        assert_eq!(v.as_membership_list(), vec!["beta", "admin"]);
    }

    #[test]
    fn comma_string_expands_trimmed_membership_list() {
        let v = Value::String(" beta ,admin ,  qa".to_string());
        assert_eq!(v.as_membership_list(), vec!["beta", "admin", "qa"]);
    }

    #[test]
    fn non_numeric_string_has_no_f64() {
        let v = Value::String("launch".to_string());
        assert_eq!(v.as_f64(), None);
    }
}

//! `BareHeaders`: a mapping from header name (original case) to either a
//! single value or an ordered sequence of values (spec.md §3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BareError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

/// Insertion order is preserved; callers that need a case-insensitive
/// lookup go through [`BareHeaders::get`].
#[derive(Debug, Clone, Default)]
pub struct BareHeaders {
    entries: Vec<(String, HeaderValue)>,
}

impl BareHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: HeaderValue) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, HeaderValue)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Parses the `x-bare-headers` JSON object. Values that are neither a
    /// string nor an array of strings are rejected with
    /// `INVALID_BARE_HEADER` (spec.md §4.F (ii)).
    pub fn from_json(raw: &str) -> Result<Self, BareError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| BareError::invalid(format!("x-bare-headers is not valid JSON: {e}")))?;
        let Value::Object(map) = value else {
            return Err(BareError::invalid("x-bare-headers must be a JSON object"));
        };

        let mut headers = BareHeaders::new();
        for (name, v) in map {
            let header_value = match v {
                Value::String(s) => HeaderValue::Single(s),
                Value::Array(items) => {
                    let mut strings = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::String(s) => strings.push(s),
                            _ => {
                                return Err(BareError::invalid(format!(
                                    "x-bare-headers.{name} must be a string or array of strings"
                                )));
                            }
                        }
                    }
                    HeaderValue::Multi(strings)
                }
                _ => {
                    return Err(BareError::invalid(format!(
                        "x-bare-headers.{name} must be a string or array of strings"
                    )));
                }
            };
            headers.insert(name, header_value);
        }
        Ok(headers)
    }

    pub fn to_json(&self) -> String {
        let map: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, v)| {
                let json_value = match v {
                    HeaderValue::Single(s) => Value::String(s.clone()),
                    HeaderValue::Multi(items) => {
                        Value::Array(items.iter().cloned().map(Value::String).collect())
                    }
                };
                (k.clone(), json_value)
            })
            .collect();
        Value::Object(map).to_string()
    }

    /// Flattens to a plain lowercase-keyed map, combining multi-values
    /// with `", "` (spec.md §4.A "flatten header").
    pub fn to_lowercase_map(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), crate::codec::flatten_header(v)))
            .collect()
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_array_values() {
        let h = BareHeaders::from_json(r#"{"User-Agent":"t","X-Multi":["a","b"]}"#).unwrap();
        assert_eq!(h.get("user-agent"), Some(&HeaderValue::Single("t".to_string())));
        assert_eq!(
            h.get("x-multi"),
            Some(&HeaderValue::Multi(vec!["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn rejects_non_string_leaf_values() {
        assert!(BareHeaders::from_json(r#"{"X":1}"#).is_err());
        assert!(BareHeaders::from_json(r#"{"X":["a",1]}"#).is_err());
        assert!(BareHeaders::from_json(r#"{"X":{"y":"z"}}"#).is_err());
    }

    #[test]
    fn rejects_non_object_top_level() {
        assert!(BareHeaders::from_json("[]").is_err());
        assert!(BareHeaders::from_json("\"x\"").is_err());
    }

    #[test]
    fn flatten_joins_multi_with_comma_space() {
        let h = BareHeaders::from_json(r#"{"Set-Cookie":["a=1","b=2"]}"#).unwrap();
        assert_eq!(h.to_lowercase_map().get("set-cookie").unwrap(), "a=1, b=2");
    }
}

//! Typed record keys and the open attribute map.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use crate::types::Result;

/// Open, schemaless attributes of a record.
pub type Attributes = BTreeMap<String, Value>;

/// Primary key: a partition name plus an optional time sort key (µs since epoch).
///
/// Single-field tables (agents, blobs) leave `time` empty; chronological
/// tables always set it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

impl Key {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time: None,
        }
    }

    pub fn timed(name: impl Into<String>, time: i64) -> Self {
        Self {
            name: name.into(),
            time: Some(time),
        }
    }

    /// Key stamped with the current time.
    pub fn now(name: impl Into<String>) -> Self {
        Self::timed(name, now_micros())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.time {
            Some(time) => write!(f, "{}@{}", self.name, time),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// A stored item: typed key plus attribute map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: Key,
    #[serde(default)]
    pub attrs: Attributes,
}

impl Record {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            attrs: Attributes::new(),
        }
    }

    pub fn with_attrs(key: Key, attrs: Attributes) -> Self {
        Self { key, attrs }
    }

    /// Builder-style attribute insert.
    pub fn with(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(attr.into(), value.into());
        self
    }

    /// Attribute lookup that also resolves the key fields `name` and `time`.
    pub fn value(&self, attr: &str) -> Option<Cow<'_, Value>> {
        if let Some(value) = self.attrs.get(attr) {
            return Some(Cow::Borrowed(value));
        }
        match attr {
            "name" => Some(Cow::Owned(Value::String(self.key.name.clone()))),
            "time" => self.key.time.map(|t| Cow::Owned(Value::from(t))),
            _ => None,
        }
    }

    pub fn get_str(&self, attr: &str) -> Option<&str> {
        self.attrs.get(attr).and_then(Value::as_str)
    }

    pub fn get_i64(&self, attr: &str) -> Option<i64> {
        self.attrs.get(attr).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, attr: &str) -> Option<f64> {
        self.attrs.get(attr).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, attr: &str) -> Option<bool> {
        self.attrs.get(attr).and_then(Value::as_bool)
    }

    /// String members of a set-valued attribute.
    pub fn get_set(&self, attr: &str) -> Vec<String> {
        match self.attrs.get(attr) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Deserialize a structured attribute.
    pub fn decode<T: DeserializeOwned>(&self, attr: &str) -> Result<Option<T>> {
        match self.attrs.get(attr) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_display() {
        assert_eq!(Key::name("agent-1").to_string(), "agent-1");
        assert_eq!(Key::timed("job", 42).to_string(), "job@42");
    }

    #[test]
    fn test_key_ordering_by_name_then_time() {
        let mut keys = vec![Key::timed("b", 1), Key::timed("a", 2), Key::timed("a", 1)];
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::timed("a", 1), Key::timed("a", 2), Key::timed("b", 1)]
        );
    }

    #[test]
    fn test_value_resolves_key_fields() {
        let record = Record::new(Key::timed("job", 7)).with("status", "queued");
        assert_eq!(record.value("name").unwrap().as_ref(), &json!("job"));
        assert_eq!(record.value("time").unwrap().as_ref(), &json!(7));
        assert_eq!(record.value("status").unwrap().as_ref(), &json!("queued"));
        assert!(record.value("missing").is_none());
    }

    #[test]
    fn test_get_set_skips_non_strings() {
        let record = Record::new(Key::name("x")).with("links", json!(["self", 3, "a.o"]));
        assert_eq!(record.get_set("links"), vec!["self", "a.o"]);
        assert!(record.get_set("absent").is_empty());
    }

    #[test]
    fn test_decode_structured_attribute() {
        let record = Record::new(Key::name("x")).with("pair", json!([1, 2]));
        let pair: Option<(i32, i32)> = record.decode("pair").unwrap();
        assert_eq!(pair, Some((1, 2)));
        let none: Option<i32> = record.decode("absent").unwrap();
        assert!(none.is_none());
    }
}

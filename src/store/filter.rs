//! Scan predicates.
//!
//! Filters are a small serializable expression tree so that a remote backend
//! can translate them into its own filter language; the in-memory table
//! evaluates them directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::record::Record;

/// Predicate over a record's attributes (including key fields `name`/`time`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    All,
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Exists(String),
    BeginsWith(String, String),
    Contains(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(attr.into(), value.into())
    }

    pub fn ne(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(attr.into(), value.into())
    }

    pub fn gt(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(attr.into(), value.into())
    }

    pub fn lt(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(attr.into(), value.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut fs), f) => {
                fs.push(f);
                Filter::And(fs)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::Or(vec![self, other])
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Evaluate against a record. Comparisons between mismatched types are false.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(attr, v) => record.value(attr).is_some_and(|x| values_equal(&x, v)),
            Filter::Ne(attr, v) => !record.value(attr).is_some_and(|x| values_equal(&x, v)),
            Filter::Lt(attr, v) => compare(record, attr, v) == Some(Ordering::Less),
            Filter::Le(attr, v) => matches!(
                compare(record, attr, v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Gt(attr, v) => compare(record, attr, v) == Some(Ordering::Greater),
            Filter::Ge(attr, v) => matches!(
                compare(record, attr, v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Exists(attr) => record.value(attr).is_some(),
            Filter::BeginsWith(attr, prefix) => record
                .value(attr)
                .is_some_and(|x| x.as_str().is_some_and(|s| s.starts_with(prefix.as_str()))),
            Filter::Contains(attr, v) => record.value(attr).is_some_and(|x| match x.as_ref() {
                Value::Array(items) => items.iter().any(|i| values_equal(i, v)),
                Value::String(s) => v.as_str().is_some_and(|needle| s.contains(needle)),
                _ => false,
            }),
            Filter::And(fs) => fs.iter().all(|f| f.matches(record)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(record)),
            Filter::Not(f) => !f.matches(record),
        }
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

fn compare(record: &Record, attr: &str, rhs: &Value) -> Option<Ordering> {
    let lhs = record.value(attr)?;
    match (lhs.as_ref(), rhs) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

//! Table store contract.
//!
//! The table store is the only synchronization primitive shared between
//! agents. It must offer single-record conditional writes, atomic numeric
//! add, paginated filtered scans and a distinguishable throttling error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::filter::Filter;
use super::record::{Attributes, Key, Record};
use crate::types::Error;

/// Backend-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    /// Provisioned throughput exceeded; safe to retry after a pause.
    #[error("throughput exceeded")]
    ThroughputExceeded,

    /// The write's condition did not hold.
    #[error("conditional check failed")]
    ConditionFailed,

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<TableError> for Error {
    fn from(err: TableError) -> Self {
        match err {
            TableError::ThroughputExceeded => {
                Error::store_unavailable("throughput exceeded after retries")
            }
            TableError::ConditionFailed => Error::store("unexpected conditional check failure"),
            TableError::Backend(msg) => Error::store(msg),
        }
    }
}

/// Write guard evaluated atomically with the write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The record exists.
    Exists,
    /// The record does not exist.
    NotExists,
    /// The record exists and `attr` currently equals the value.
    Equals(String, Value),
}

/// One attribute mutation inside an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Update {
    Set(String, Value),
    /// Numeric add; a missing attribute counts as zero.
    Add(String, Value),
    AddToSet(String, Vec<Value>),
    RemoveFromSet(String, Vec<Value>),
    Remove(String),
}

impl Update {
    pub fn attr(&self) -> &str {
        match self {
            Update::Set(a, _)
            | Update::Add(a, _)
            | Update::AddToSet(a, _)
            | Update::RemoveFromSet(a, _)
            | Update::Remove(a) => a,
        }
    }
}

/// One page of scan results.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Record>,
    /// Resume point; `None` when the scan is complete.
    pub cursor: Option<Key>,
}

/// Keyed record store with conditional writes.
#[async_trait]
pub trait TableStore: Send + Sync + std::fmt::Debug {
    async fn get_item(&self, key: &Key) -> Result<Option<Attributes>, TableError>;

    /// Write a whole record, returning the attributes it replaced.
    async fn put_item(
        &self,
        record: Record,
        condition: Option<Condition>,
    ) -> Result<Option<Attributes>, TableError>;

    /// Apply updates atomically (creating the record if unconditioned),
    /// returning the previous values of the updated attributes.
    async fn update_item(
        &self,
        key: &Key,
        updates: Vec<Update>,
        condition: Option<Condition>,
    ) -> Result<Attributes, TableError>;

    async fn delete_item(&self, key: &Key) -> Result<Option<Attributes>, TableError>;

    /// Examine up to `limit` records after `cursor`, returning those matching `filter`.
    async fn scan(
        &self,
        filter: &Filter,
        cursor: Option<Key>,
        limit: usize,
    ) -> Result<ScanPage, TableError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_error_mapping() {
        let err: Error = TableError::ThroughputExceeded.into();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        let err: Error = TableError::Backend("boom".into()).into();
        assert_eq!(err.to_string(), "store error: boom");
    }

    #[test]
    fn test_update_attr() {
        assert_eq!(Update::Add("count".into(), Value::from(1)).attr(), "count");
        assert_eq!(Update::Remove("kill".into()).attr(), "kill");
    }
}

//! Record store: typed CRUD over a [`TableStore`] with throttling retries.
//!
//! Every call goes through [`Database::retry`], which absorbs
//! `ThroughputExceeded` with the configured backoff schedule and surfaces
//! `StoreUnavailable` once the schedule is exhausted. Conditional writes
//! report a lost race as `Ok(false)`.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use super::filter::Filter;
use super::record::{Attributes, Key, Record};
use super::table::{Condition, TableError, TableStore, Update};
use crate::types::{Error, Result, RetryPolicy, StoreConfig};

/// Handle on one table. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    name: String,
    table: Arc<dyn TableStore>,
    retry: RetryPolicy,
    page_size: usize,
}

impl Database {
    pub fn new(name: impl Into<String>, table: Arc<dyn TableStore>) -> Self {
        let defaults = StoreConfig::default();
        Self {
            name: name.into(),
            table,
            retry: defaults.retry,
            page_size: defaults.scan_page_size,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Apply retry and paging settings from configuration.
    pub fn configured(self, config: &StoreConfig) -> Self {
        self.with_retry(config.retry.clone())
            .with_page_size(config.scan_page_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a table call, retrying while the backend reports throttling.
    async fn retry<T, F, Fut>(&self, op: &str, mut call: F) -> std::result::Result<T, TableError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, TableError>>,
    {
        let pauses = self.retry.pauses();
        let mut attempt = 0;
        loop {
            match call().await {
                Err(TableError::ThroughputExceeded) if attempt < pauses.len() => {
                    tracing::warn!(
                        "store_throttled: table={}, op={}, attempt={}",
                        self.name,
                        op,
                        attempt + 1
                    );
                    tokio::time::sleep(pauses[attempt]).await;
                    attempt += 1;
                }
                Err(TableError::ThroughputExceeded) => {
                    tracing::error!("store_unavailable: table={}, op={}", self.name, op);
                    return Err(TableError::ThroughputExceeded);
                }
                other => return other,
            }
        }
    }

    /// Fetch a record; a miss is `NotFound`.
    pub async fn get(&self, key: &Key) -> Result<Record> {
        self.find(key)
            .await?
            .ok_or_else(|| Error::not_found(format!("{}[{}]", self.name, key)))
    }

    /// Fetch a record; a miss is `None`.
    pub async fn find(&self, key: &Key) -> Result<Option<Record>> {
        let attrs = self.retry("get", || self.table.get_item(key)).await?;
        Ok(attrs.map(|attrs| Record::with_attrs(key.clone(), attrs)))
    }

    /// Write a whole record, returning what it replaced.
    ///
    /// With `insert_if_absent`, an existing record is an `AlreadyExists` error.
    pub async fn put(&self, record: Record, insert_if_absent: bool) -> Result<Option<Attributes>> {
        let condition = insert_if_absent.then_some(Condition::NotExists);
        let key = record.key.clone();
        match self
            .retry("put", || self.table.put_item(record.clone(), condition.clone()))
            .await
        {
            Ok(prev) => Ok(prev),
            Err(TableError::ConditionFailed) => Err(Error::already_exists(format!(
                "{}[{}]",
                self.name, key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply updates under an optional condition.
    ///
    /// Returns the previous values of the updated attributes, or `None` if the
    /// condition did not hold.
    pub async fn update(
        &self,
        key: &Key,
        updates: Vec<Update>,
        condition: Option<Condition>,
    ) -> Result<Option<Attributes>> {
        match self
            .retry("update", || {
                self.table
                    .update_item(key, updates.clone(), condition.clone())
            })
            .await
        {
            Ok(old) => Ok(Some(old)),
            Err(TableError::ConditionFailed) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Update an existing record; `NotFound` if it is missing.
    async fn update_existing(&self, key: &Key, updates: Vec<Update>) -> Result<Attributes> {
        self.update(key, updates, Some(Condition::Exists))
            .await?
            .ok_or_else(|| Error::not_found(format!("{}[{}]", self.name, key)))
    }

    pub async fn set(&self, key: &Key, attr: &str, value: impl Into<Value>) -> Result<()> {
        self.update_existing(key, vec![Update::Set(attr.to_string(), value.into())])
            .await?;
        Ok(())
    }

    /// Compare-and-swap: succeeds iff `attr` currently equals `old`.
    pub async fn set_if(
        &self,
        key: &Key,
        attr: &str,
        old: impl Into<Value>,
        new: impl Into<Value>,
    ) -> Result<bool> {
        let swapped = self
            .update(
                key,
                vec![Update::Set(attr.to_string(), new.into())],
                Some(Condition::Equals(attr.to_string(), old.into())),
            )
            .await?;
        Ok(swapped.is_some())
    }

    /// Atomic increment of an existing record's counter; returns the previous value.
    pub async fn add(&self, key: &Key, attr: &str, delta: i64) -> Result<i64> {
        let old = self
            .update_existing(key, vec![Update::Add(attr.to_string(), Value::from(delta))])
            .await?;
        Ok(old.get(attr).and_then(Value::as_i64).unwrap_or(0))
    }

    /// Atomic floating-point accumulate (walltime and similar).
    pub async fn add_f64(&self, key: &Key, attr: &str, delta: f64) -> Result<()> {
        self.update_existing(key, vec![Update::Add(attr.to_string(), Value::from(delta))])
            .await?;
        Ok(())
    }

    pub async fn add_to_set(&self, key: &Key, attr: &str, values: &[String]) -> Result<()> {
        let values = values.iter().cloned().map(Value::from).collect();
        self.update_existing(key, vec![Update::AddToSet(attr.to_string(), values)])
            .await?;
        Ok(())
    }

    pub async fn remove_from_set(&self, key: &Key, attr: &str, values: &[String]) -> Result<()> {
        let values = values.iter().cloned().map(Value::from).collect();
        self.update_existing(key, vec![Update::RemoveFromSet(attr.to_string(), values)])
            .await?;
        Ok(())
    }

    /// Delete a record; returns whether it existed.
    pub async fn delete(&self, key: &Key) -> Result<bool> {
        let prev = self.retry("delete", || self.table.delete_item(key)).await?;
        Ok(prev.is_some())
    }

    /// Lazily scan all records matching `filter`, page by page.
    pub fn scan(&self, filter: Filter) -> BoxStream<'static, Result<Record>> {
        struct State {
            db: Database,
            filter: Filter,
            cursor: Option<Key>,
            buffer: VecDeque<Record>,
            exhausted: bool,
        }

        let state = State {
            db: self.clone(),
            filter,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::try_unfold(state, |mut st| async move {
            loop {
                if let Some(record) = st.buffer.pop_front() {
                    return Ok::<_, Error>(Some((record, st)));
                }
                if st.exhausted {
                    return Ok::<_, Error>(None);
                }
                let page = st
                    .db
                    .retry("scan", || {
                        st.db
                            .table
                            .scan(&st.filter, st.cursor.clone(), st.db.page_size)
                    })
                    .await
                    .map_err(Error::from)?;
                st.buffer.extend(page.items);
                st.exhausted = page.cursor.is_none();
                st.cursor = page.cursor;
            }
        })
        .boxed()
    }

    /// Collect a full scan.
    pub async fn scan_all(&self, filter: Filter) -> Result<Vec<Record>> {
        self.scan(filter).try_collect().await
    }

    /// Histogram of an attribute's string values over the whole table.
    pub async fn counts(&self, attr: &str) -> Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        let mut records = self.scan(Filter::All);
        while let Some(record) = records.try_next().await? {
            let bucket = match record.value(attr) {
                Some(v) => match v.as_ref() {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                None => "none".to_string(),
            };
            *counts.entry(bucket).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

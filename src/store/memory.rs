//! In-process table store.
//!
//! Honors the full conditional-update contract under a single lock, so it is
//! a faithful stand-in for a remote table when several agents share one
//! process (tests, local runs). Throughput faults can be injected to exercise
//! the retry layer.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::filter::{values_equal, Filter};
use super::record::{Attributes, Key, Record};
use super::table::{Condition, ScanPage, TableError, TableStore, Update};

#[derive(Debug, Default)]
pub struct MemoryTable {
    items: RwLock<BTreeMap<Key, Attributes>>,
    throttled: AtomicUsize,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with `ThroughputExceeded`.
    pub fn throttle_next(&self, n: usize) {
        self.throttled.store(n, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    fn check_throttle(&self) -> Result<(), TableError> {
        let hit = self
            .throttled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(TableError::ThroughputExceeded)
        } else {
            Ok(())
        }
    }
}

fn check(condition: Option<&Condition>, current: Option<&Attributes>, key: &Key) -> Result<(), TableError> {
    let ok = match (condition, current) {
        (None, _) => true,
        (Some(Condition::Exists), current) => current.is_some(),
        (Some(Condition::NotExists), current) => current.is_none(),
        (Some(Condition::Equals(attr, expected)), Some(attrs)) => {
            let record = Record::with_attrs(key.clone(), attrs.clone());
            record.value(attr).is_some_and(|v| values_equal(&v, expected))
        }
        (Some(Condition::Equals(..)), None) => false,
    };
    if ok {
        Ok(())
    } else {
        Err(TableError::ConditionFailed)
    }
}

fn add_numbers(current: Option<&Value>, delta: &Value) -> Result<Value, TableError> {
    let current = match current {
        None | Some(Value::Null) => Value::from(0),
        Some(v) => v.clone(),
    };
    match (current.as_i64(), delta.as_i64()) {
        (Some(a), Some(b)) => a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| TableError::Backend("numeric overflow".to_string())),
        _ => match (current.as_f64(), delta.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::from(a + b)),
            _ => Err(TableError::Backend("ADD on a non-numeric attribute".to_string())),
        },
    }
}

fn apply(attrs: &mut Attributes, update: Update) -> Result<(), TableError> {
    match update {
        Update::Set(attr, value) => {
            attrs.insert(attr, value);
        }
        Update::Add(attr, delta) => {
            let next = add_numbers(attrs.get(&attr), &delta)?;
            attrs.insert(attr, next);
        }
        Update::AddToSet(attr, values) => {
            let entry = attrs
                .entry(attr)
                .or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(items) = entry else {
                return Err(TableError::Backend("ADD to a non-set attribute".to_string()));
            };
            for value in values {
                if !items.iter().any(|i| values_equal(i, &value)) {
                    items.push(value);
                }
            }
        }
        Update::RemoveFromSet(attr, values) => {
            if let Some(Value::Array(items)) = attrs.get_mut(&attr) {
                items.retain(|i| !values.iter().any(|v| values_equal(i, v)));
            }
        }
        Update::Remove(attr) => {
            attrs.remove(&attr);
        }
    }
    Ok(())
}

#[async_trait]
impl TableStore for MemoryTable {
    async fn get_item(&self, key: &Key) -> Result<Option<Attributes>, TableError> {
        self.check_throttle()?;
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn put_item(
        &self,
        record: Record,
        condition: Option<Condition>,
    ) -> Result<Option<Attributes>, TableError> {
        self.check_throttle()?;
        let mut items = self.items.write().await;
        check(condition.as_ref(), items.get(&record.key), &record.key)?;
        Ok(items.insert(record.key, record.attrs))
    }

    async fn update_item(
        &self,
        key: &Key,
        updates: Vec<Update>,
        condition: Option<Condition>,
    ) -> Result<Attributes, TableError> {
        self.check_throttle()?;
        let mut items = self.items.write().await;
        check(condition.as_ref(), items.get(key), key)?;

        let mut next = items.get(key).cloned().unwrap_or_default();
        let mut old = Attributes::new();
        for update in updates {
            if let Some(prev) = next.get(update.attr()) {
                old.insert(update.attr().to_string(), prev.clone());
            }
            apply(&mut next, update)?;
        }
        items.insert(key.clone(), next);
        Ok(old)
    }

    async fn delete_item(&self, key: &Key) -> Result<Option<Attributes>, TableError> {
        self.check_throttle()?;
        Ok(self.items.write().await.remove(key))
    }

    async fn scan(
        &self,
        filter: &Filter,
        cursor: Option<Key>,
        limit: usize,
    ) -> Result<ScanPage, TableError> {
        self.check_throttle()?;
        let items = self.items.read().await;
        let lower = match cursor {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };

        let mut page = ScanPage::default();
        let mut examined = 0;
        let mut last = None;
        let mut range = items.range((lower, Bound::Unbounded)).peekable();
        while let Some((key, attrs)) = range.next() {
            examined += 1;
            let record = Record::with_attrs(key.clone(), attrs.clone());
            if filter.matches(&record) {
                page.items.push(record);
            }
            last = Some(key.clone());
            if examined >= limit.max(1) {
                if range.peek().is_some() {
                    page.cursor = last.take();
                }
                break;
            }
        }
        Ok(page)
    }
}

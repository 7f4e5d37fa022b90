//! Records that own blobs.
//!
//! Every record written through [`LinkedTable`] carries a `links` set naming
//! the blobs it holds a reference on, plus the [`SELF_LINK`] sentinel.
//! Deleting the record releases those references.

use bytes::Bytes;
use serde_json::json;
use std::collections::BTreeSet;

use crate::blob::{BlobStore, SELF_LINK};
use crate::store::{Attributes, Database, Key, Record};
use crate::types::Result;

pub const LINKS_ATTR: &str = "links";

#[derive(Debug, Clone)]
pub struct LinkedTable {
    db: Database,
    files: BlobStore,
}

impl LinkedTable {
    pub fn new(db: Database, files: BlobStore) -> Self {
        Self { db, files }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn files(&self) -> &BlobStore {
        &self.files
    }

    pub async fn get(&self, key: &Key) -> Result<Record> {
        self.db.get(key).await
    }

    pub async fn find(&self, key: &Key) -> Result<Option<Record>> {
        self.db.find(key).await
    }

    /// Write a record, forcing `self` into its link set.
    pub async fn put(&self, key: Key, attrs: Attributes, insert_if_absent: bool) -> Result<()> {
        let mut record = Record::with_attrs(key, attrs);
        let mut links: BTreeSet<String> = record.get_set(LINKS_ATTR).into_iter().collect();
        links.insert(SELF_LINK.to_string());
        record = record.with(LINKS_ATTR, json!(links.into_iter().collect::<Vec<_>>()));
        self.db.put(record, insert_if_absent).await?;
        Ok(())
    }

    /// Store a blob owned by `key` and add it to the record's link set.
    pub async fn put_linked(
        &self,
        key: &Key,
        path: &str,
        data: Bytes,
        links: &[String],
        replace: bool,
    ) -> Result<()> {
        self.db
            .add_to_set(key, LINKS_ATTR, &[path.to_string()])
            .await?;
        self.files.put(path, data, links, replace).await
    }

    /// Release owned blobs and drop them from the link set.
    pub async fn remove_linked(&self, key: &Key, paths: &[String]) -> Result<usize> {
        let deleted = self.files.release(paths).await?;
        self.db.remove_from_set(key, LINKS_ATTR, paths).await?;
        Ok(deleted)
    }

    /// Duplicate a record under a new key, taking a reference on each linked blob.
    pub async fn copy_item(&self, old: &Key, new: Key) -> Result<Record> {
        let source = self.db.get(old).await?;
        let record = Record::with_attrs(new, source.attrs);
        self.db.put(record.clone(), true).await?;
        for link in record.get_set(LINKS_ATTR) {
            self.files.acquire(&link).await?;
        }
        Ok(record)
    }

    /// Release every blob the record owns, then delete it.
    ///
    /// Returns the number of blobs deleted by the cascade. Releasing a record
    /// that is already gone logs a warning and does nothing.
    pub async fn release(&self, key: &Key) -> Result<usize> {
        let Some(record) = self.db.find(key).await? else {
            tracing::warn!("record_already_released: table={}, key={}", self.db.name(), key);
            return Ok(0);
        };
        let deleted = self.files.release(&record.get_set(LINKS_ATTR)).await?;
        self.db.delete(key).await?;
        Ok(deleted)
    }
}

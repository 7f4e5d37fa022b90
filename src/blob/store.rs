//! Reference-counted blob storage.
//!
//! Each blob has a record `{count, links}` in a table and its bytes in a
//! [`BlobBackend`]. `links` names further blobs this blob owns, so releasing
//! one blob can cascade through a DAG of shared artifacts.

use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::backend::BlobBackend;
use super::SELF_LINK;
use crate::store::{Database, Filter, Key, Record};
use crate::types::{Error, Result};

/// Reserved record naming the backing bucket.
pub const BUCKET_KEY: &str = "BUCKET";

/// Summary of one stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub path: String,
    pub count: i64,
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    db: Database,
    backend: Arc<dyn BlobBackend>,
    bucket: String,
}

impl BlobStore {
    /// Create (or overwrite) the bucket record and return the store.
    pub async fn create(
        db: Database,
        backend: Arc<dyn BlobBackend>,
        bucket: impl Into<String>,
    ) -> Result<Self> {
        let bucket = bucket.into();
        db.put(
            Record::new(Key::name(BUCKET_KEY)).with("name", bucket.clone()),
            false,
        )
        .await?;
        Ok(Self {
            db,
            backend,
            bucket,
        })
    }

    /// Open a store whose bucket record already exists.
    pub async fn open(db: Database, backend: Arc<dyn BlobBackend>) -> Result<Self> {
        let record = db.get(&Key::name(BUCKET_KEY)).await?;
        let bucket = record
            .get_str("name")
            .ok_or_else(|| Error::inconsistent(format!("{} record has no name", BUCKET_KEY)))?
            .to_string();
        Ok(Self {
            db,
            backend,
            bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Store bytes under `path` with a reference count of one.
    ///
    /// With `replace` an existing blob is swapped atomically: the new bytes are
    /// uploaded under a temporary path and moved over the old one before the
    /// record is rewritten, and only then are the old content's links released.
    pub async fn put(
        &self,
        path: &str,
        data: Bytes,
        links: &[String],
        replace: bool,
    ) -> Result<()> {
        if path == BUCKET_KEY || path == SELF_LINK || path.is_empty() {
            return Err(Error::validation(format!("reserved blob path: {:?}", path)));
        }
        let key = Key::name(path);
        let mut all_links = BTreeSet::from([SELF_LINK.to_string()]);
        all_links.extend(links.iter().cloned());

        if !replace && self.db.find(&key).await?.is_some() {
            return Err(Error::already_exists(format!("blob {}", path)));
        }

        if replace && self.backend.exists(path).await? {
            let swap = format!("{}.{}.swap", path, uuid::Uuid::new_v4());
            self.backend.put(&swap, data).await?;
            self.backend.rename(&swap, path).await?;
        } else {
            self.backend.put(path, data).await?;
        }

        let previous = self.db.find(&key).await?;
        let count = previous
            .as_ref()
            .and_then(|p| p.get_i64("count"))
            .filter(|c| *c > 0)
            .unwrap_or(1);
        let record = Record::new(key)
            .with("count", count)
            .with("links", json!(all_links.iter().collect::<Vec<_>>()));
        self.db.put(record, !replace).await?;

        if let Some(previous) = previous {
            let stale: Vec<String> = previous
                .get_set("links")
                .into_iter()
                .filter(|l| l != SELF_LINK && !all_links.contains(l))
                .collect();
            if !stale.is_empty() {
                self.release(&stale).await?;
            }
        }
        tracing::debug!("blob_stored: path={}, replace={}", path, replace);
        Ok(())
    }

    /// Take one more reference on a blob.
    pub async fn acquire(&self, path: &str) -> Result<()> {
        if path == SELF_LINK {
            return Ok(());
        }
        self.db.add(&Key::name(path), "count", 1).await?;
        Ok(())
    }

    /// Drop one reference on each path, deleting blobs that reach zero.
    ///
    /// Dead blobs release their own links through an explicit worklist; the
    /// records and bytes are deleted only once the whole cascade is known, so
    /// an interrupted release leaves zero-count records for [`Self::clean_up`].
    /// Returns the number of blobs deleted.
    pub async fn release(&self, paths: &[String]) -> Result<usize> {
        let mut pending: Vec<String> = paths
            .iter()
            .filter(|p| p.as_str() != SELF_LINK)
            .cloned()
            .collect();
        let mut dead = BTreeSet::new();

        while let Some(path) = pending.pop() {
            let key = Key::name(&path);
            let previous = match self.db.add(&key, "count", -1).await {
                Ok(previous) => previous,
                Err(e) if e.is_not_found() => {
                    tracing::warn!("blob_already_released: path={}", path);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if previous > 1 {
                continue;
            }
            if previous <= 0 {
                tracing::warn!("blob_double_release: path={}, count={}", path, previous);
            }
            if let Some(record) = self.db.find(&key).await? {
                pending.extend(
                    record
                        .get_set("links")
                        .into_iter()
                        .filter(|l| l != SELF_LINK),
                );
            }
            dead.insert(path);
        }

        self.delete_dead(dead).await
    }

    async fn delete_dead(&self, dead: BTreeSet<String>) -> Result<usize> {
        if dead.is_empty() {
            return Ok(0);
        }
        let dead: Vec<String> = dead.into_iter().collect();
        for path in &dead {
            self.db.delete(&Key::name(path)).await?;
        }
        self.backend.delete(&dead).await?;
        tracing::debug!("blobs_deleted: count={}", dead.len());
        Ok(dead.len())
    }

    /// Delete records left at a non-positive count by an interrupted release.
    ///
    /// Their links are not released again: [`Self::release`] decrements the
    /// whole cascade before deleting anything, so children of a zero-count
    /// record were already counted down.
    pub async fn clean_up(&self) -> Result<usize> {
        let orphans = self
            .db
            .scan_all(Filter::Le("count".to_string(), Value::from(0)))
            .await?;
        let dead: BTreeSet<String> = orphans
            .into_iter()
            .map(|record| record.key.name)
            .filter(|name| name != BUCKET_KEY)
            .collect();
        self.delete_dead(dead).await
    }

    pub async fn load(&self, path: &str) -> Result<Bytes> {
        self.backend.get(path).await
    }

    pub async fn load_string(&self, path: &str) -> Result<String> {
        let data = self.load(path).await?;
        String::from_utf8(data.to_vec())
            .map_err(|e| Error::blob(format!("blob {} is not utf-8: {}", path, e)))
    }

    /// Whether a blob record exists.
    pub async fn contains(&self, path: &str) -> Result<bool> {
        Ok(self.db.find(&Key::name(path)).await?.is_some())
    }

    /// Current reference count, if the blob exists.
    pub async fn count(&self, path: &str) -> Result<Option<i64>> {
        Ok(self
            .db
            .find(&Key::name(path))
            .await?
            .and_then(|r| r.get_i64("count")))
    }

    /// All blobs except the bucket record, ordered by path.
    pub async fn list(&self) -> Result<Vec<BlobInfo>> {
        let records = self
            .db
            .scan_all(Filter::ne("name", BUCKET_KEY))
            .await?;
        let mut infos: Vec<BlobInfo> = records
            .into_iter()
            .map(|r| BlobInfo {
                count: r.get_i64("count").unwrap_or(0),
                links: r
                    .get_set("links")
                    .into_iter()
                    .filter(|l| l != SELF_LINK)
                    .collect(),
                path: r.key.name,
            })
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }
}

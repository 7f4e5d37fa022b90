//! Time-keyed tables.
//!
//! Records are keyed by `(name, time)` with time in microseconds since the
//! epoch. The reserved record `(FILES, 0)` names the blob table backing the
//! table's artifacts and is hidden from every query.

use std::sync::Arc;
use std::time::Duration;

use crate::blob::{BlobBackend, BlobStore};
use crate::link::LinkedTable;
use crate::store::{now_micros, Attributes, Database, Filter, Key, Record};
use crate::types::{Error, Result};

pub const FILES_KEY: &str = "FILES";
const FILES_TABLE_ATTR: &str = "files_table";

const MINUTE: u64 = 60;
const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;
const MONTH: u64 = 2_629_800;

#[derive(Debug, Clone)]
pub struct ChronoTable {
    linked: LinkedTable,
}

impl ChronoTable {
    /// Record which blob table backs `db` and return the table.
    pub async fn create(db: Database, files: BlobStore) -> Result<Self> {
        let bootstrap = Record::new(files_key())
            .with(FILES_TABLE_ATTR, files.database().name().to_string());
        db.put(bootstrap, false).await?;
        Ok(Self {
            linked: LinkedTable::new(db, files),
        })
    }

    /// Open a table, resolving its blob table from the `FILES` record.
    pub async fn open<F>(db: Database, backend: Arc<dyn BlobBackend>, resolve: F) -> Result<Self>
    where
        F: FnOnce(&str) -> Database,
    {
        let bootstrap = db.get(&files_key()).await?;
        let files_table = bootstrap.get_str(FILES_TABLE_ATTR).ok_or_else(|| {
            Error::inconsistent(format!("{} record has no {}", FILES_KEY, FILES_TABLE_ATTR))
        })?;
        let files = BlobStore::open(resolve(files_table), backend).await?;
        Ok(Self {
            linked: LinkedTable::new(db, files),
        })
    }

    pub fn linked(&self) -> &LinkedTable {
        &self.linked
    }

    pub fn database(&self) -> &Database {
        self.linked.database()
    }

    pub fn files(&self) -> &BlobStore {
        self.linked.files()
    }

    /// Insert a record, stamping the current time when the key has none.
    pub async fn put(&self, key: Key, attrs: Attributes) -> Result<Key> {
        let key = match key.time {
            Some(_) => key,
            None => Key::now(key.name),
        };
        if key.name == FILES_KEY {
            return Err(Error::validation(format!("{} is a reserved name", FILES_KEY)));
        }
        self.linked.put(key.clone(), attrs, false).await?;
        Ok(key)
    }

    pub async fn get(&self, key: &Key) -> Result<Record> {
        self.linked.get(key).await
    }

    pub async fn release(&self, key: &Key) -> Result<usize> {
        self.linked.release(key).await
    }

    /// All records with this name, oldest first.
    pub async fn by_name(&self, name: &str) -> Result<Vec<Record>> {
        self.select(Filter::eq("name", name)).await
    }

    /// The most recent record with this name.
    pub async fn latest(&self, name: &str) -> Result<Record> {
        self.by_name(name)
            .await?
            .pop()
            .ok_or_else(|| Error::not_found(format!("{}[{}]", self.database().name(), name)))
    }

    /// Records newer than `now - window`, oldest first.
    pub async fn since(&self, window: Duration) -> Result<Vec<Record>> {
        let window = i64::try_from(window.as_micros()).unwrap_or(i64::MAX);
        let cutoff = now_micros().saturating_sub(window);
        self.select(Filter::gt("time", cutoff)).await
    }

    pub async fn last_minute(&self, n: u32) -> Result<Vec<Record>> {
        self.since(Duration::from_secs(MINUTE * u64::from(n))).await
    }

    pub async fn last_hour(&self, n: u32) -> Result<Vec<Record>> {
        self.since(Duration::from_secs(HOUR * u64::from(n))).await
    }

    pub async fn last_day(&self, n: u32) -> Result<Vec<Record>> {
        self.since(Duration::from_secs(DAY * u64::from(n))).await
    }

    pub async fn last_month(&self, n: u32) -> Result<Vec<Record>> {
        self.since(Duration::from_secs(MONTH * u64::from(n))).await
    }

    /// Release every record with this name; returns how many were released.
    pub async fn clear_name(&self, name: &str) -> Result<usize> {
        let records = self.by_name(name).await?;
        for record in &records {
            self.linked.release(&record.key).await?;
        }
        Ok(records.len())
    }

    /// Every record, oldest first.
    pub async fn all(&self) -> Result<Vec<Record>> {
        self.select(Filter::All).await
    }

    /// Matching records, oldest first, without the bootstrap record.
    pub async fn select(&self, filter: Filter) -> Result<Vec<Record>> {
        let filter = filter.and(Filter::ne("name", FILES_KEY));
        let mut records = self.database().scan_all(filter).await?;
        records.sort_by_key(|r| r.key.time.unwrap_or_default());
        Ok(records)
    }
}

fn files_key() -> Key {
    Key::timed(FILES_KEY, 0)
}

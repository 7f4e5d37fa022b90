//! Agent registry: liveness records and the failure detector.
//!
//! Each agent keeps one record `{status, now, heartbeat, work, kill, ...}`.
//! `now` is refreshed by pings; an agent silent for more than twice its
//! heartbeat period is presumed dead and its claimed jobs are requeued.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::job::{Job, JobStore};
use crate::store::{now_micros, Attributes, Condition, Database, Filter, Key, Record, Update};
use crate::types::{AgentKey, Result};

/// Attribute names of an agent record.
pub mod attrs {
    pub const STATUS: &str = "status";
    pub const NOW: &str = "now";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const WORK: &str = "work";
    pub const KILL: &str = "kill";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Unavailable,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Running => "running",
            AgentStatus::Unavailable => "unavailable",
        }
    }
}

/// A job claimed by an agent, stored as `[table, name, time]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub table: String,
    pub key: Key,
}

impl WorkItem {
    pub fn new(table: impl Into<String>, key: Key) -> Self {
        Self {
            table: table.into(),
            key,
        }
    }

    pub fn to_value(&self) -> Value {
        json!([self.table, self.key.name, self.key.time])
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let table = items.first()?.as_str()?;
        let name = items.get(1)?.as_str()?;
        let time = items.get(2).and_then(Value::as_i64);
        Some(Self {
            table: table.to_string(),
            key: Key {
                name: name.to_string(),
                time,
            },
        })
    }
}

/// Outcome of a liveness sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Agents this sweep moved to unavailable.
    pub released: usize,
    /// Every agent found stale, including ones another sweep got to first.
    pub stale: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    db: Database,
}

impl AgentRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn record_key(key: &AgentKey) -> Key {
        Key::name(key.as_str())
    }

    pub async fn get(&self, key: &AgentKey) -> Result<Record> {
        self.db.get(&Self::record_key(key)).await
    }

    pub async fn find(&self, key: &AgentKey) -> Result<Option<Record>> {
        self.db.find(&Self::record_key(key)).await
    }

    /// Overwrite the agent's record, stamping `now` when absent.
    /// Returns the replaced attributes so a pending kill flag can be seen.
    pub async fn register(&self, key: &AgentKey, mut fields: Attributes) -> Result<Option<Attributes>> {
        fields
            .entry(attrs::NOW.to_string())
            .or_insert_with(|| Value::from(now_micros()));
        self.db
            .put(Record::with_attrs(Self::record_key(key), fields), false)
            .await
    }

    /// Rewrite a running agent's fields and stamp `now`, consuming any kill flag.
    ///
    /// `None` when the agent is no longer running (reaped, released or
    /// missing); the caller must stop. Otherwise whether a kill was pending.
    pub async fn refresh(&self, key: &AgentKey, fields: Attributes) -> Result<Option<bool>> {
        let mut updates: Vec<Update> = fields
            .into_iter()
            .filter(|(name, _)| name != attrs::STATUS && name != attrs::KILL)
            .map(|(name, value)| Update::Set(name, value))
            .collect();
        if !updates.iter().any(|u| u.attr() == attrs::NOW) {
            updates.push(Update::Set(attrs::NOW.to_string(), Value::from(now_micros())));
        }
        updates.push(Update::Remove(attrs::KILL.to_string()));

        let previous = self
            .db
            .update(
                &Self::record_key(key),
                updates,
                Some(Condition::Equals(
                    attrs::STATUS.to_string(),
                    Value::from(AgentStatus::Running.as_str()),
                )),
            )
            .await?;
        Ok(previous.map(|old| {
            old.get(attrs::KILL)
                .and_then(Value::as_bool)
                .unwrap_or(false)
        }))
    }

    /// Mark a running agent unavailable and requeue its claimed jobs.
    ///
    /// Only the caller that performs the transition requeues work, so
    /// concurrent sweeps cannot reset a job another agent has since claimed.
    pub async fn release(&self, key: &AgentKey, jobs: &JobStore) -> Result<bool> {
        let record_key = Self::record_key(key);
        let record = self.db.get(&record_key).await?;
        let released = self
            .db
            .set_if(
                &record_key,
                attrs::STATUS,
                AgentStatus::Running.as_str(),
                AgentStatus::Unavailable.as_str(),
            )
            .await?;
        if released {
            let work = match record.attrs.get(attrs::WORK) {
                Some(Value::Array(items)) => items.iter().filter_map(WorkItem::from_value).collect(),
                _ => Vec::new(),
            };
            for item in work {
                if item.table != jobs.name() {
                    tracing::warn!(
                        "work_in_unknown_table: agent={}, table={}, job={}",
                        key,
                        item.table,
                        item.key
                    );
                    continue;
                }
                if let Err(e) = jobs.reset_if_running(&item.key).await {
                    tracing::warn!("work_reset_failed: agent={}, job={}, error={}", key, item.key, e);
                }
            }
            self.db.set(&record_key, attrs::WORK, json!([])).await?;
            tracing::info!(agent = %key, "agent_released");
        }
        Ok(released)
    }

    /// Refresh liveness. `Ok(false)` means the agent is no longer running
    /// (reaped or killed) and should stop pinging.
    pub async fn ping(&self, key: &AgentKey, heartbeat: Duration) -> Result<bool> {
        let updated = self
            .db
            .update(
                &Self::record_key(key),
                vec![
                    Update::Set(attrs::NOW.to_string(), Value::from(now_micros())),
                    Update::Set(
                        attrs::HEARTBEAT.to_string(),
                        Value::from(heartbeat.as_secs_f64()),
                    ),
                ],
                Some(Condition::Equals(
                    attrs::STATUS.to_string(),
                    Value::from(AgentStatus::Running.as_str()),
                )),
            )
            .await?;
        Ok(updated.is_some())
    }

    /// Ask an agent to stop at its next refresh.
    pub async fn kill(&self, key: &AgentKey) -> Result<()> {
        self.db.set(&Self::record_key(key), attrs::KILL, true).await
    }

    pub async fn running(&self) -> Result<Vec<Record>> {
        self.db
            .scan_all(Filter::eq(attrs::STATUS, AgentStatus::Running.as_str()))
            .await
    }

    pub async fn unavailable(&self) -> Result<Vec<Record>> {
        self.db
            .scan_all(Filter::eq(attrs::STATUS, AgentStatus::Unavailable.as_str()))
            .await
    }

    /// Whether a running agent's last ping is older than twice its heartbeat.
    /// `None` when the record carries no ping time.
    fn is_stale(record: &Record, default_heartbeat: Duration, now: i64) -> Option<bool> {
        let last = record.get_i64(attrs::NOW)?;
        let heartbeat = record
            .get_f64(attrs::HEARTBEAT)
            .unwrap_or_else(|| default_heartbeat.as_secs_f64());
        let limit = (2.0 * heartbeat * 1e6) as i64;
        Some(now - last > limit)
    }

    /// Release every running agent that stopped pinging.
    pub async fn cleanup(&self, jobs: &JobStore, default_heartbeat: Duration) -> Result<CleanupReport> {
        let now = now_micros();
        let mut report = CleanupReport::default();
        for record in self.running().await? {
            match Self::is_stale(&record, default_heartbeat, now) {
                None => {
                    tracing::warn!("agent_without_heartbeat: agent={}", record.key.name);
                }
                Some(false) => {}
                Some(true) => {
                    report.stale.push(record.key.name.clone());
                    let key = match AgentKey::from_string(record.key.name.clone()) {
                        Ok(key) => key,
                        Err(e) => {
                            tracing::warn!("agent_key_invalid: name={}, error={}", record.key.name, e);
                            continue;
                        }
                    };
                    if self.release(&key, jobs).await? {
                        report.released += 1;
                    }
                }
            }
        }
        if !report.stale.is_empty() {
            tracing::info!(
                "cleanup_complete: stale={}, released={}",
                report.stale.len(),
                report.released
            );
        }
        Ok(report)
    }

    /// Running jobs that no live agent lists in its work.
    pub async fn zombies(&self, jobs: &JobStore, default_heartbeat: Duration) -> Result<Vec<Job>> {
        let now = now_micros();
        let mut running = jobs.running().await?;
        for record in self.running().await? {
            if Self::is_stale(&record, default_heartbeat, now) != Some(false) {
                continue;
            }
            if let Some(Value::Array(work)) = record.attrs.get(attrs::WORK) {
                for item in work.iter().filter_map(WorkItem::from_value) {
                    if item.table == jobs.name() {
                        running.retain(|job| job.key != item.key);
                    }
                }
            }
        }
        Ok(running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobStore, MemoryBlobs};
    use crate::chrono_table::ChronoTable;
    use crate::job::{JobPayload, JobSpec, JobStatus};
    use crate::store::MemoryTable;
    use std::sync::Arc;

    async fn setup() -> (AgentRegistry, JobStore) {
        let files = BlobStore::create(
            Database::new("files", Arc::new(MemoryTable::new())),
            Arc::new(MemoryBlobs::new()),
            "bucket",
        )
        .await
        .unwrap();
        let jobs = JobStore::new(
            ChronoTable::create(Database::new("jobs", Arc::new(MemoryTable::new())), files)
                .await
                .unwrap(),
        );
        let registry = AgentRegistry::new(Database::new("agents", Arc::new(MemoryTable::new())));
        (registry, jobs)
    }

    fn agent(name: &str) -> AgentKey {
        AgentKey::from_string(name.to_string()).unwrap()
    }

    fn running_record(work: &[WorkItem], now: i64, heartbeat: f64) -> Attributes {
        let mut fields = Attributes::new();
        fields.insert(attrs::STATUS.into(), "running".into());
        fields.insert(attrs::NOW.into(), now.into());
        fields.insert(attrs::HEARTBEAT.into(), heartbeat.into());
        fields.insert(
            attrs::WORK.into(),
            Value::Array(work.iter().map(WorkItem::to_value).collect()),
        );
        fields
    }

    #[tokio::test]
    async fn test_refresh_refuses_released_agent() {
        let (registry, jobs) = setup().await;
        let key = agent("n1");
        registry
            .register(&key, running_record(&[], now_micros(), 60.0))
            .await
            .unwrap();
        let mut fields = Attributes::new();
        fields.insert(attrs::STATUS.into(), "running".into());
        fields.insert("node".into(), "n1".into());
        assert_eq!(registry.refresh(&key, fields.clone()).await.unwrap(), Some(false));

        registry.kill(&key).await.unwrap();
        assert_eq!(registry.refresh(&key, fields.clone()).await.unwrap(), Some(true));
        let record = registry.get(&key).await.unwrap();
        assert_eq!(record.get_bool(attrs::KILL), None);

        assert!(registry.release(&key, &jobs).await.unwrap());
        assert_eq!(registry.refresh(&key, fields.clone()).await.unwrap(), None);
        let record = registry.get(&key).await.unwrap();
        assert_eq!(record.get_str(attrs::STATUS), Some("unavailable"));

        assert_eq!(registry.refresh(&agent("missing"), fields).await.unwrap(), None);
    }

    async fn claimed_job(jobs: &JobStore, name: &str, owner: &AgentKey) -> Key {
        let key = jobs
            .put(name, JobSpec::new(JobPayload::new("true")))
            .await
            .unwrap();
        assert!(jobs.claim(&key, owner).await.unwrap());
        key
    }

    #[test]
    fn test_work_item_encoding() {
        let item = WorkItem::new("jobs", Key::timed("sim", 12));
        assert_eq!(item.to_value(), json!(["jobs", "sim", 12]));
        assert_eq!(WorkItem::from_value(&item.to_value()), Some(item));
        assert_eq!(WorkItem::from_value(&json!("nope")), None);
    }

    #[tokio::test]
    async fn test_register_returns_previous_kill_flag() {
        let (registry, _) = setup().await;
        let key = agent("n1");
        assert!(registry
            .register(&key, running_record(&[], now_micros(), 60.0))
            .await
            .unwrap()
            .is_none());
        registry.kill(&key).await.unwrap();
        let previous = registry
            .register(&key, running_record(&[], now_micros(), 60.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous.get(attrs::KILL), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_ping_requires_running() {
        let (registry, jobs) = setup().await;
        let key = agent("n1");
        registry
            .register(&key, running_record(&[], 0, 60.0))
            .await
            .unwrap();
        assert!(registry.ping(&key, Duration::from_secs(30)).await.unwrap());
        let record = registry.get(&key).await.unwrap();
        assert!(record.get_i64(attrs::NOW).unwrap() > 0);
        assert_eq!(record.get_f64(attrs::HEARTBEAT), Some(30.0));

        assert!(registry.release(&key, &jobs).await.unwrap());
        assert!(!registry.ping(&key, Duration::from_secs(30)).await.unwrap());
        assert!(!registry.ping(&agent("ghost"), Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requeues_work_once() {
        let (registry, jobs) = setup().await;
        let key = agent("n1");
        let job = claimed_job(&jobs, "job", &key).await;
        registry
            .register(
                &key,
                running_record(&[WorkItem::new("jobs", job.clone())], now_micros(), 60.0),
            )
            .await
            .unwrap();

        assert!(registry.release(&key, &jobs).await.unwrap());
        assert_eq!(jobs.get(&job).await.unwrap().status, JobStatus::Queued);
        assert_eq!(registry.get(&key).await.unwrap().attrs[attrs::WORK], json!([]));

        // Someone else claims it; a second release must not touch it.
        assert!(jobs.claim(&job, &agent("n2")).await.unwrap());
        assert!(!registry.release(&key, &jobs).await.unwrap());
        assert_eq!(jobs.get(&job).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_stale_agents() {
        let (registry, jobs) = setup().await;
        let stale = agent("stale");
        let live = agent("live");
        let job = claimed_job(&jobs, "job", &stale).await;
        let ten_minutes_ago = now_micros() - 600_000_000;
        registry
            .register(
                &stale,
                running_record(&[WorkItem::new("jobs", job.clone())], ten_minutes_ago, 60.0),
            )
            .await
            .unwrap();
        registry
            .register(&live, running_record(&[], now_micros(), 60.0))
            .await
            .unwrap();
        let mut silent = running_record(&[], 0, 60.0);
        silent.remove(attrs::NOW);
        registry
            .db
            .put(Record::with_attrs(Key::name("silent"), silent), false)
            .await
            .unwrap();

        let report = registry
            .cleanup(&jobs, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            report,
            CleanupReport {
                released: 1,
                stale: vec!["stale".to_string()]
            }
        );
        assert_eq!(jobs.get(&job).await.unwrap().status, JobStatus::Queued);
        assert_eq!(registry.unavailable().await.unwrap().len(), 1);
        assert_eq!(registry.running().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zombies_are_running_jobs_without_live_owner() {
        let (registry, jobs) = setup().await;
        let live = agent("live");
        let owned = claimed_job(&jobs, "owned", &live).await;
        let orphan = claimed_job(&jobs, "orphan", &agent("gone")).await;
        registry
            .register(
                &live,
                running_record(&[WorkItem::new("jobs", owned)], now_micros(), 60.0),
            )
            .await
            .unwrap();

        let zombies = registry
            .zombies(&jobs, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].key, orphan);
    }
}

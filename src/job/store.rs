//! Job table: submission, claiming and settlement of jobs.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::archive::{JobArchive, JobPayload};
use super::selector::ResourceSelector;
use super::types::{attrs, Job, JobStatus};
use crate::blob::SELF_LINK;
use crate::chrono_table::ChronoTable;
use crate::link::LINKS_ATTR;
use crate::store::{Attributes, Database, Filter, Key, Record};
use crate::types::{AgentConfig, AgentKey, Error, Result};

/// Everything needed to submit a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub payload: JobPayload,
    /// Files and directories shipped with the payload, unpacked by base name.
    pub paths: Vec<PathBuf>,
    /// Requeue instead of timing out when interrupted.
    pub restart: bool,
    pub selector: Option<ResourceSelector>,
    /// Existing blobs the archive depends on; each gains a reference.
    pub links: Vec<String>,
    pub attrs: Attributes,
    /// Submission time in µs; now when unset.
    pub time: Option<i64>,
}

impl JobSpec {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            paths: Vec::new(),
            restart: false,
            selector: None,
            links: Vec::new(),
            attrs: Attributes::new(),
            time: None,
        }
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn selector(mut self, selector: ResourceSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn link(mut self, blob: impl Into<String>) -> Self {
        self.links.push(blob.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn at(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }
}

#[derive(Debug, Clone)]
pub struct JobStore {
    table: ChronoTable,
    output_suffix: String,
}

impl JobStore {
    pub fn new(table: ChronoTable) -> Self {
        Self {
            table,
            output_suffix: AgentConfig::default().output_suffix,
        }
    }

    pub fn with_output_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.output_suffix = suffix.into();
        self
    }

    pub fn table(&self) -> &ChronoTable {
        &self.table
    }

    pub fn name(&self) -> &str {
        self.db().name()
    }

    fn db(&self) -> &Database {
        self.table.database()
    }

    /// Submit a job.
    ///
    /// The record is written `unavailable` and only becomes `queued` once its
    /// archive is stored, so no agent can claim a job with a partial upload.
    pub async fn put(&self, name: &str, spec: JobSpec) -> Result<Key> {
        let key = match spec.time {
            Some(time) => Key::timed(name, time),
            None => Key::now(name),
        };
        let paths = spec
            .paths
            .iter()
            .map(|p| {
                p.file_name()
                    .map(|n| Value::from(n.to_string_lossy().into_owned()))
                    .ok_or_else(|| Error::validation(format!("path {} has no file name", p.display())))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut item = spec.attrs.clone();
        item.insert(attrs::STATUS.into(), JobStatus::Unavailable.as_str().into());
        item.insert(attrs::ATTEMPTS.into(), 0.into());
        item.insert(attrs::CHECKPOINTS.into(), 0.into());
        item.insert(attrs::RESTART.into(), spec.restart.into());
        item.insert(attrs::PATHS.into(), Value::Array(paths));
        item.insert(
            attrs::FILES_TABLE.into(),
            self.table.files().database().name().into(),
        );
        item.insert(
            attrs::SELECTOR.into(),
            match &spec.selector {
                Some(selector) => serde_json::to_value(selector)?,
                None => Value::Null,
            },
        );
        item.remove(LINKS_ATTR);
        let key = self.table.put(key, item).await?;

        let archive = JobArchive::pack(spec.payload, &spec.paths).await?;
        let file = format!("{}-{}.job", key.name, key.time.unwrap_or_default());
        self.db().set(&key, attrs::FILE, file.clone()).await?;
        for link in &spec.links {
            self.table.files().acquire(link).await?;
        }
        self.table
            .linked()
            .put_linked(&key, &file, archive.to_bytes()?, &spec.links, false)
            .await?;
        self.db()
            .set(&key, attrs::STATUS, JobStatus::Queued.as_str())
            .await?;
        tracing::info!(job = %key, "job_queued");
        Ok(key)
    }

    pub async fn get(&self, key: &Key) -> Result<Job> {
        Job::try_from(self.table.get(key).await?)
    }

    pub async fn latest(&self, name: &str) -> Result<Job> {
        Job::try_from(self.table.latest(name).await?)
    }

    /// Move a queued job to running. Exactly one concurrent caller wins.
    pub async fn claim(&self, key: &Key, agent: &AgentKey) -> Result<bool> {
        if !self.transition(key, JobStatus::Queued, JobStatus::Running).await? {
            return Ok(false);
        }
        let mut agents = self.db().get(key).await?.get_set(attrs::AGENTS);
        agents.push(agent.to_string());
        self.db().set(key, attrs::AGENTS, json!(agents)).await?;
        tracing::info!(job = %key, agent = %agent, "job_claimed");
        Ok(true)
    }

    /// Put a running job back in the queue. Safe to repeat.
    pub async fn reset_if_running(&self, key: &Key) -> Result<bool> {
        let reset = self.transition(key, JobStatus::Running, JobStatus::Queued).await?;
        if reset {
            tracing::info!(job = %key, "job_requeued");
        }
        Ok(reset)
    }

    /// Settle a running job.
    ///
    /// A job that is not running means the caller's bookkeeping is wrong and
    /// is reported as `Inconsistent`. With `remove`, a completed job drops its
    /// archive.
    pub async fn release_with_status(&self, key: &Key, status: JobStatus, remove: bool) -> Result<()> {
        if !JobStatus::Running.can_transition_to(status) {
            return Err(Error::validation(format!("cannot release a job as {}", status)));
        }
        let record = self.db().get(key).await?;
        if !self.transition(key, JobStatus::Running, status).await? {
            let current = self
                .db()
                .find(key)
                .await?
                .and_then(|r| r.get_str(attrs::STATUS).map(str::to_string))
                .unwrap_or_else(|| "missing".to_string());
            return Err(Error::inconsistent(format!(
                "job {} should be running for release but is {}",
                key, current
            )));
        }
        if remove && status == JobStatus::Complete {
            if let Some(file) = record.get_str(attrs::FILE) {
                self.table
                    .linked()
                    .remove_linked(key, &[file.to_string()])
                    .await?;
            }
        }
        tracing::info!(job = %key, status = %status, "job_released");
        Ok(())
    }

    async fn transition(&self, key: &Key, from: JobStatus, to: JobStatus) -> Result<bool> {
        self.db()
            .set_if(key, attrs::STATUS, from.as_str(), to.as_str())
            .await
    }

    /// Decode a job's archive.
    pub async fn archive(&self, job: &Job) -> Result<JobArchive> {
        let file = job
            .file
            .as_deref()
            .ok_or_else(|| Error::not_found(format!("archive of job {}", job.key)))?;
        let data = self.table.files().load(file).await?;
        JobArchive::from_bytes(&data)
    }

    /// Repack the job's `paths` from `dir` and swap the archive in place.
    /// Returns the new checkpoint count.
    pub async fn checkpoint(&self, key: &Key, dir: &Path) -> Result<i64> {
        let job = self.get(key).await?;
        let file = job
            .file
            .clone()
            .ok_or_else(|| Error::not_found(format!("archive of job {}", key)))?;
        let payload = self.archive(&job).await?.payload;
        let archive = JobArchive::pack_dir(payload, dir, &job.paths).await?;
        let links: Vec<String> = self
            .table
            .files()
            .database()
            .get(&Key::name(file.as_str()))
            .await?
            .get_set(LINKS_ATTR)
            .into_iter()
            .filter(|l| l != SELF_LINK)
            .collect();
        self.table
            .linked()
            .put_linked(key, &file, archive.to_bytes()?, &links, true)
            .await?;
        let checkpoints = self.db().add(key, attrs::CHECKPOINTS, 1).await? + 1;
        tracing::info!(job = %key, checkpoints = checkpoints, "job_checkpointed");
        Ok(checkpoints)
    }

    /// Count one more execution attempt; returns the new total.
    pub async fn record_attempt(&self, key: &Key) -> Result<i64> {
        Ok(self.db().add(key, attrs::ATTEMPTS, 1).await? + 1)
    }

    pub async fn add_walltime(&self, key: &Key, seconds: f64) -> Result<()> {
        self.db().add_f64(key, attrs::WALLTIME, seconds).await
    }

    /// Blob path of the job's captured output.
    pub fn output_path(&self, key: &Key) -> String {
        format!(
            "{}-{}{}",
            key.name,
            key.time.unwrap_or_default(),
            self.output_suffix
        )
    }

    /// Captured output of the last run; empty when there is none.
    pub async fn output(&self, key: &Key) -> Result<String> {
        let record = self.table.get(key).await?;
        let Some(path) = record
            .get_set(LINKS_ATTR)
            .into_iter()
            .find(|l| l.ends_with(&self.output_suffix))
        else {
            return Ok(String::new());
        };
        match self.table.files().load_string(&path).await {
            Ok(output) => Ok(output),
            Err(e) if e.is_not_found() => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Store (replacing) the job's captured output; returns its blob path.
    pub async fn put_output(&self, key: &Key, output: String) -> Result<String> {
        let path = self.output_path(key);
        self.table
            .linked()
            .put_linked(key, &path, output.into(), &[], true)
            .await?;
        Ok(path)
    }

    /// Queued jobs in submission order.
    pub async fn queued(&self) -> Result<Vec<Job>> {
        self.by_status(JobStatus::Queued).await
    }

    pub async fn running(&self) -> Result<Vec<Job>> {
        self.by_status(JobStatus::Running).await
    }

    /// Jobs with this status, oldest first.
    pub async fn by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.table
            .select(Filter::eq(attrs::STATUS, status.as_str()))
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    pub async fn all(&self) -> Result<Vec<Record>> {
        self.table.all().await
    }

    /// Number of jobs per status.
    pub async fn counts(&self) -> Result<BTreeMap<String, usize>> {
        let mut counts = self.db().counts(attrs::STATUS).await?;
        // The bootstrap record has no status.
        if let Some(none) = counts.get_mut("none") {
            *none -= 1;
            if *none == 0 {
                counts.remove("none");
            }
        }
        Ok(counts)
    }

    /// Delete a job together with every blob it owns.
    pub async fn release(&self, key: &Key) -> Result<usize> {
        self.table.release(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobStore, MemoryBlobs};
    use crate::store::MemoryTable;
    use std::sync::Arc;

    async fn jobs() -> JobStore {
        let files = BlobStore::create(
            Database::new("files", Arc::new(MemoryTable::new())),
            Arc::new(MemoryBlobs::new()),
            "bucket",
        )
        .await
        .unwrap();
        let table = ChronoTable::create(Database::new("jobs", Arc::new(MemoryTable::new())), files)
            .await
            .unwrap();
        JobStore::new(table)
    }

    fn agent(name: &str) -> AgentKey {
        AgentKey::from_string(name.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_put_queues_after_upload() {
        let jobs = jobs().await;
        let key = jobs
            .put("sim", JobSpec::new(JobPayload::shell("echo hi")).attr("cpus", 2))
            .await
            .unwrap();
        let job = jobs.get(&key).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.checkpoints, 0);
        let file = job.file.clone().unwrap();
        assert!(file.ends_with(".job"));
        assert!(job.links.contains(&file));
        assert!(job.links.contains(&SELF_LINK.to_string()));
        let archive = jobs.archive(&job).await.unwrap();
        assert_eq!(archive.payload, JobPayload::shell("echo hi"));
    }

    #[tokio::test]
    async fn test_claim_exactly_once() {
        let jobs = jobs().await;
        let key = jobs
            .put("sim", JobSpec::new(JobPayload::new("true")))
            .await
            .unwrap();
        assert!(jobs.claim(&key, &agent("a")).await.unwrap());
        assert!(!jobs.claim(&key, &agent("b")).await.unwrap());
        assert_eq!(jobs.get(&key).await.unwrap().agents, vec!["a"]);
    }

    #[tokio::test]
    async fn test_state_machine_paths() {
        let jobs = jobs().await;
        let key = jobs
            .put("sim", JobSpec::new(JobPayload::new("true")))
            .await
            .unwrap();

        // Releasing a job that is not running is a bookkeeping bug.
        let err = jobs
            .release_with_status(&key, JobStatus::Complete, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistent(_)));

        assert!(!jobs.reset_if_running(&key).await.unwrap());
        assert!(jobs.claim(&key, &agent("a")).await.unwrap());
        assert!(jobs.reset_if_running(&key).await.unwrap());
        assert!(!jobs.reset_if_running(&key).await.unwrap());
        assert!(jobs.claim(&key, &agent("b")).await.unwrap());
        jobs.release_with_status(&key, JobStatus::Complete, false)
            .await
            .unwrap();
        assert!(!jobs.claim(&key, &agent("c")).await.unwrap());
        assert!(!jobs.reset_if_running(&key).await.unwrap());

        let job = jobs.get(&key).await.unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.agents, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_release_complete_with_remove_drops_archive() {
        let jobs = jobs().await;
        let key = jobs
            .put("sim", JobSpec::new(JobPayload::new("true")))
            .await
            .unwrap();
        let file = jobs.get(&key).await.unwrap().file.unwrap();
        jobs.claim(&key, &agent("a")).await.unwrap();
        jobs.release_with_status(&key, JobStatus::Complete, true)
            .await
            .unwrap();
        assert!(!jobs.table().files().contains(&file).await.unwrap());
        assert!(!jobs.get(&key).await.unwrap().links.contains(&file));
    }

    #[tokio::test]
    async fn test_output_and_counters() {
        let jobs = jobs().await;
        let key = jobs
            .put("sim", JobSpec::new(JobPayload::new("true")))
            .await
            .unwrap();
        assert_eq!(jobs.output(&key).await.unwrap(), "");
        let path = jobs.put_output(&key, "first".to_string()).await.unwrap();
        assert!(path.ends_with(".o"));
        jobs.put_output(&key, "second".to_string()).await.unwrap();
        assert_eq!(jobs.output(&key).await.unwrap(), "second");

        assert_eq!(jobs.record_attempt(&key).await.unwrap(), 1);
        assert_eq!(jobs.record_attempt(&key).await.unwrap(), 2);
        jobs.add_walltime(&key, 1.5).await.unwrap();
        jobs.add_walltime(&key, 1.0).await.unwrap();
        assert_eq!(jobs.get(&key).await.unwrap().walltime, 2.5);
    }

    #[tokio::test]
    async fn test_checkpoint_swaps_archive() {
        let jobs = jobs().await;
        let src = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("state"), b"0").await.unwrap();
        let key = jobs
            .put(
                "sim",
                JobSpec::new(JobPayload::new("true"))
                    .path(src.path().join("state"))
                    .restart(true),
            )
            .await
            .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        tokio::fs::write(scratch.path().join("state"), b"7")
            .await
            .unwrap();
        assert_eq!(jobs.checkpoint(&key, scratch.path()).await.unwrap(), 1);

        let job = jobs.get(&key).await.unwrap();
        let archive = jobs.archive(&job).await.unwrap();
        assert_eq!(archive.files[0].data, b"7");
        assert_eq!(job.checkpoints, 1);
    }

    #[tokio::test]
    async fn test_queued_in_submission_order_and_counts() {
        let jobs = jobs().await;
        for (name, time) in [("b", 3), ("a", 1), ("c", 2)] {
            jobs.put(name, JobSpec::new(JobPayload::new("true")).at(time))
                .await
                .unwrap();
        }
        let names: Vec<_> = jobs
            .queued()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.key.name)
            .collect();
        assert_eq!(names, vec!["a", "c", "b"]);

        let first = jobs.queued().await.unwrap().remove(0);
        jobs.claim(&first.key, &agent("x")).await.unwrap();
        let counts = jobs.counts().await.unwrap();
        assert_eq!(counts.get("queued"), Some(&2));
        assert_eq!(counts.get("running"), Some(&1));
        assert!(!counts.contains_key("none"));
    }

    #[tokio::test]
    async fn test_release_deletes_job_and_blobs() {
        let jobs = jobs().await;
        let key = jobs
            .put("sim", JobSpec::new(JobPayload::new("true")))
            .await
            .unwrap();
        jobs.put_output(&key, "out".to_string()).await.unwrap();
        assert_eq!(jobs.release(&key).await.unwrap(), 2);
        assert!(jobs.get(&key).await.unwrap_err().is_not_found());
        assert!(jobs.table().files().list().await.unwrap().is_empty());
    }
}

//! Agent runtime: the listen loop that claims jobs and supervises their tasks.
//!
//! ```text
//! starting ─▶ listening ─▶ { claiming ─▶ running-task }* ─▶ idle | timeout | killed | error
//! ```
//!
//! An agent reserves resources for a job before racing other agents for it
//! and gives them back if it loses. Each claimed job runs in its own tokio
//! task that supervises the child process and settles the job record.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{spawn_heartbeat, HeartbeatExit};
use super::platform::Platform;
use super::registry::{attrs, AgentRegistry, AgentStatus, WorkItem};
use super::resources::{AgentResources, ResourcePool};
use crate::job::{Job, JobStatus, JobStore};
use crate::store::Attributes;
use crate::task::Task;
use crate::types::{AgentConfig, AgentKey, Result, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    Idle,
    Timeout,
    Killed,
    Error,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::Idle => "idle",
            ExitReason::Timeout => "timeout",
            ExitReason::Killed => "killed",
            ExitReason::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct ActiveWork {
    item: WorkItem,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct Agent {
    key: AgentKey,
    platform: Platform,
    config: AgentConfig,
    registry: AgentRegistry,
    resources: Arc<Mutex<AgentResources>>,
    work: Vec<ActiveWork>,
    refusals: usize,
    deadline: Option<Instant>,
    heartbeat: CancellationToken,
    heartbeat_handle: Option<JoinHandle<HeartbeatExit>>,
    /// Cancelled when the heartbeat finds the agent no longer running.
    lost: CancellationToken,
    cancel_work: CancellationToken,
}

impl Agent {
    /// Register the agent and start its heartbeat.
    ///
    /// A stale registration under the same key (a previous incarnation that
    /// crashed) is released first so its claimed jobs return to the queue.
    pub async fn start(
        platform: Platform,
        registry: AgentRegistry,
        jobs: &JobStore,
        config: AgentConfig,
    ) -> Result<Self> {
        let key = platform.key()?;
        match registry.release(&key, jobs).await {
            Ok(true) => tracing::info!(agent = %key, "stale_registration_cleared"),
            Ok(false) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let deadline = platform.timeout.map(|t| Instant::now() + t);
        let mut agent = Self {
            key,
            resources: Arc::new(Mutex::new(AgentResources::new(platform.resources.clone()))),
            platform,
            config,
            registry,
            work: Vec::new(),
            refusals: 0,
            deadline,
            heartbeat: CancellationToken::new(),
            heartbeat_handle: None,
            lost: CancellationToken::new(),
            cancel_work: CancellationToken::new(),
        };
        // A kill flag left on the old record was meant for the old process.
        let fields = agent.record_fields().await?;
        agent.registry.register(&agent.key, fields).await?;
        agent.heartbeat_handle = Some(spawn_heartbeat(
            agent.registry.clone(),
            agent.key.clone(),
            agent.platform.heartbeat,
            deadline,
            agent.heartbeat.clone(),
            agent.lost.clone(),
        ));
        tracing::info!(agent = %agent.key, "agent_started");
        Ok(agent)
    }

    pub fn key(&self) -> &AgentKey {
        &self.key
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn refusals(&self) -> usize {
        self.refusals
    }

    pub fn active_work(&self) -> usize {
        self.work.iter().filter(|w| !w.handle.is_finished()).count()
    }

    /// Resources not reserved by running work.
    pub async fn available(&self) -> ResourcePool {
        self.resources.lock().await.available().clone()
    }

    /// When tasks are interrupted and the loop stops accepting work: two
    /// release delays before the deadline, one for the task's grace period
    /// and one to settle its results.
    fn stop_at(&self) -> Option<Instant> {
        let margin = self.config.release_delay * 2;
        self.deadline
            .map(|d| d.checked_sub(margin).unwrap_or_else(Instant::now))
    }

    async fn record_fields(&mut self) -> Result<Attributes> {
        self.work.retain(|w| !w.handle.is_finished());
        let (available, total) = {
            let resources = self.resources.lock().await;
            (
                serde_json::to_value(resources.available())?,
                serde_json::to_value(resources.total())?,
            )
        };
        let mut fields = Attributes::new();
        fields.insert(attrs::STATUS.into(), AgentStatus::Running.as_str().into());
        fields.insert(
            attrs::WORK.into(),
            Value::Array(self.work.iter().map(|w| w.item.to_value()).collect()),
        );
        fields.insert(
            attrs::HEARTBEAT.into(),
            self.platform.heartbeat.as_secs_f64().into(),
        );
        fields.insert("node".into(), self.platform.node.clone().into());
        if let Some(host) = &self.platform.host {
            fields.insert("host".into(), host.clone().into());
        }
        if let Some(user) = &self.platform.user {
            fields.insert("user".into(), user.clone().into());
        }
        if let Some(timeout) = self.platform.timeout {
            fields.insert("timeout".into(), timeout.as_secs_f64().into());
        }
        fields.insert("resources".into(), available);
        fields.insert("total".into(), total);
        Ok(fields)
    }

    /// Rewrite the registry record and ping. Returns whether the agent must
    /// stop: a kill was requested, or the record is no longer running
    /// because a cleanup sweep reaped it.
    pub async fn refresh(&mut self) -> Result<bool> {
        let fields = self.record_fields().await?;
        match self.registry.refresh(&self.key, fields).await? {
            None => {
                tracing::warn!(agent = %self.key, "agent_reaped");
                return Ok(true);
            }
            Some(true) => {
                tracing::warn!(agent = %self.key, "kill_requested");
                return Ok(true);
            }
            Some(false) => {}
        }
        if !self
            .registry
            .ping(&self.key, self.platform.heartbeat)
            .await?
        {
            tracing::warn!(agent = %self.key, "agent_reaped");
            return Ok(true);
        }
        Ok(false)
    }

    /// Claim and run queued jobs until idle, out of time, or killed.
    pub async fn listen(&mut self, jobs: &JobStore) -> Result<ExitReason> {
        let stop_at = self.stop_at();
        tracing::info!(
            agent = %self.key,
            timeout = ?self.platform.timeout,
            idle_timeout = ?self.platform.idle_timeout,
            "agent_listening"
        );

        let mut last_work = Instant::now();
        loop {
            if self.lost.is_cancelled() {
                tracing::warn!(agent = %self.key, "heartbeat_lost");
                return Ok(ExitReason::Killed);
            }
            let now = Instant::now();
            if stop_at.is_some_and(|s| now >= s) {
                return Ok(ExitReason::Timeout);
            }
            if self.active_work() > 0 {
                last_work = now;
            } else if self
                .platform
                .idle_timeout
                .is_some_and(|idle| now.duration_since(last_work) > idle)
            {
                return Ok(ExitReason::Idle);
            }

            if self.refresh().await? {
                return Ok(ExitReason::Killed);
            }

            let mut accepted = false;
            for job in jobs.queued().await? {
                if self.accept_job(job, jobs).await? {
                    accepted = true;
                    break;
                }
            }
            if !accepted {
                let mut pause = self.config.poll_period;
                if let Some(stop) = stop_at {
                    pause = pause.min(stop.saturating_duration_since(Instant::now()));
                }
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.lost.cancelled() => {}
                }
            }
        }
    }

    /// Try to reserve resources for a job and claim it.
    ///
    /// Returns `false` when the job does not fit or another agent won the
    /// claim; in both cases the pool is left as it was.
    pub async fn accept_job(&mut self, job: Job, jobs: &JobStore) -> Result<bool> {
        let reserved = {
            let mut pool = self.resources.lock().await;
            let request = job.selector.evaluate(&job.record, pool.available());
            request.and_then(|request| pool.reserve(&request))
        };
        let partition = match reserved {
            Ok(partition) => partition,
            Err(e) => {
                self.refuse(&job, &e.to_string());
                return Ok(false);
            }
        };

        match jobs.claim(&job.key, &self.key).await {
            Ok(true) => {}
            Ok(false) => {
                self.restore(&partition).await;
                self.refuse(&job, "claimed by another agent");
                return Ok(false);
            }
            Err(e) => {
                self.restore(&partition).await;
                return Err(e);
            }
        }

        let item = WorkItem::new(jobs.name(), job.key.clone());
        let run_id = RunId::new();
        tracing::info!(agent = %self.key, job = %item.key, run = %run_id, "job");
        let run = TaskRun {
            run_id,
            agent: self.key.clone(),
            platform: self.platform.clone(),
            jobs: jobs.clone(),
            job,
            partition,
            resources: Arc::clone(&self.resources),
            stop_at: self.stop_at(),
            delay: self.config.release_delay,
            cancel: self.cancel_work.child_token(),
        };
        let handle = tokio::spawn(run.execute());
        self.work.push(ActiveWork { item, handle });
        Ok(true)
    }

    fn refuse(&mut self, job: &Job, reason: &str) {
        tracing::info!(
            agent = %self.key,
            job = %job.key,
            refusal = self.refusals,
            reason,
            "refusal"
        );
        self.refusals += 1;
    }

    async fn restore(&self, partition: &ResourcePool) {
        if let Err(e) = self.resources.lock().await.restore(partition) {
            tracing::error!("resource_restore_failed: agent={}, error={}", self.key, e);
        }
    }

    /// Wait for every running task to finish.
    pub async fn join_work(&mut self) {
        for work in std::mem::take(&mut self.work) {
            if let Err(e) = work.handle.await {
                tracing::warn!("task_join_failed: job={}, error={}", work.item.key, e);
            }
        }
    }

    /// Stop the heartbeat, finish (or interrupt) running tasks, requeue
    /// anything still marked running and mark the agent unavailable.
    pub async fn shutdown(&mut self, jobs: &JobStore, interrupt: bool) -> Result<()> {
        self.heartbeat.cancel();
        if let Some(handle) = self.heartbeat_handle.take() {
            match handle.await {
                Ok(exit) => tracing::debug!(agent = %self.key, exit = ?exit, "heartbeat_stopped"),
                Err(e) => tracing::warn!("heartbeat_join_failed: agent={}, error={}", self.key, e),
            }
        }
        if interrupt {
            self.cancel_work.cancel();
        }

        let claimed: Vec<WorkItem> = self.work.iter().map(|w| w.item.clone()).collect();
        self.join_work().await;
        for item in claimed {
            jobs.reset_if_running(&item.key).await?;
        }

        match self.registry.release(&self.key, jobs).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        tracing::info!(agent = %self.key, exit_time = %Utc::now().to_rfc3339(), "agent_stopped");
        Ok(())
    }

    /// Listen, then shut down. Errors from the loop become `ExitReason::Error`.
    pub async fn run(mut self, jobs: &JobStore) -> Result<ExitReason> {
        let reason = match self.listen(jobs).await {
            Ok(reason) => reason,
            Err(e) => {
                tracing::error!("agent_error: agent={}, error={}", self.key, e);
                ExitReason::Error
            }
        };
        tracing::info!(agent = %self.key, reason = %reason, "exit_reason");
        self.shutdown(jobs, matches!(reason, ExitReason::Killed | ExitReason::Error))
            .await?;
        Ok(reason)
    }
}

/// Everything a spawned task runner needs; owns its copies.
struct TaskRun {
    run_id: RunId,
    agent: AgentKey,
    platform: Platform,
    jobs: JobStore,
    job: Job,
    partition: ResourcePool,
    resources: Arc<Mutex<AgentResources>>,
    stop_at: Option<Instant>,
    delay: Duration,
    cancel: CancellationToken,
}

struct Outcome {
    status: JobStatus,
    exit_code: Option<i32>,
    output: String,
}

impl TaskRun {
    async fn execute(self) {
        let key = self.job.key.clone();
        let started = Instant::now();
        let outcome = match self.supervise().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("task_failed: job={}, error={}", key, e);
                Outcome {
                    status: JobStatus::Error,
                    exit_code: None,
                    output: format!("agent error: {}\n", e),
                }
            }
        };

        if let Err(e) = self.resources.lock().await.restore(&self.partition) {
            tracing::error!("resource_restore_failed: agent={}, error={}", self.agent, e);
        }
        if let Err(e) = self.settle(&outcome, started.elapsed()).await {
            tracing::error!("task_settle_failed: job={}, error={}", key, e);
        }
        tracing::info!(
            agent = %self.agent,
            job = %key,
            run = %self.run_id,
            status = %outcome.status,
            exit_code = ?outcome.exit_code,
            "result"
        );
    }

    async fn supervise(&self) -> Result<Outcome> {
        let key = &self.job.key;
        let out_dir = tempfile::Builder::new().prefix("jobmesh-out-").tempdir()?;
        let path = out_dir.path().join("stdout.o");

        let previous = self.jobs.output(key).await?;
        let header = format!(
            "{}agent = {}\nrun = {}\nstart time = {}\n",
            previous,
            self.agent,
            self.run_id,
            Utc::now().to_rfc3339()
        );
        tokio::fs::write(&path, header).await?;
        let attempt = self.jobs.record_attempt(key).await?;
        tracing::debug!(job = %key, attempt, "task_attempt");

        let stdout = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await?
            .into_std()
            .await;
        let mut task = Task::new(self.job.clone(), self.jobs.clone());
        let mut notes = String::new();
        let status = match task.start(&self.platform, self.partition.clone(), stdout).await {
            Ok(()) => {
                let remaining = self
                    .stop_at
                    .map(|s| s.saturating_duration_since(Instant::now()));
                tokio::select! {
                    waited = task.wait(remaining) => {
                        waited?;
                    }
                    _ = self.cancel.cancelled() => {
                        tracing::info!(job = %key, "task_cancelled");
                    }
                }
                task.release(self.delay).await?;
                match task.status() {
                    JobStatus::Running => JobStatus::Error,
                    status => status,
                }
            }
            Err(e) => {
                notes.push_str(&format!("failed to start: {}\n", e));
                task.release(Duration::ZERO).await?;
                JobStatus::Error
            }
        };

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await?;
        let footer = format!(
            "{}end time = {}\nexit code = {:?}\n",
            notes,
            Utc::now().to_rfc3339(),
            task.exit_code()
        );
        file.write_all(footer.as_bytes()).await?;
        file.flush().await?;

        let output = String::from_utf8_lossy(&tokio::fs::read(&path).await?).into_owned();
        Ok(Outcome {
            status,
            exit_code: task.exit_code(),
            output,
        })
    }

    async fn settle(&self, outcome: &Outcome, elapsed: Duration) -> Result<()> {
        let key = &self.job.key;
        // A reaped agent's job may already be requeued or claimed elsewhere.
        let current = self.jobs.get(key).await?;
        let owner = current.agents.last().map(String::as_str);
        if current.status != JobStatus::Running || owner != Some(self.agent.as_str()) {
            tracing::warn!(
                "job_reclaimed: job={}, agent={}, status={}, owner={:?}",
                key,
                self.agent,
                current.status,
                owner
            );
            return Ok(());
        }
        self.jobs.put_output(key, outcome.output.clone()).await?;
        self.jobs.add_walltime(key, elapsed.as_secs_f64()).await?;
        self.jobs.release_with_status(key, outcome.status, false).await
    }
}

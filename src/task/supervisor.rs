//! Supervision of one job run as an OS child process.
//!
//! ```text
//! Created ──start──▶ Running ──exit──────────────▶ Exited ──release──▶ Released
//!                       └──release──▶ Interrupting ──▶ Exited
//! ```
//!
//! The exit status decides the job's fate: success completes it, an
//! interruption (SIGINT/SIGTERM/SIGALRM, or their `128 + signo` exit codes)
//! requeues it when the job opted into restart and times it out otherwise,
//! and anything else is an error.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};

use super::signal;
use crate::agent::platform::{Platform, PLATFORM_ENV};
use crate::agent::resources::ResourcePool;
use crate::job::{Job, JobStatus, JobStore};
use crate::types::{Error, Result};

/// Environment variable holding the JSON key of the job a task runs.
pub const JOB_ENV: &str = "JOBMESH_JOB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Interrupting,
    Exited,
    Released,
}

#[derive(Debug)]
pub struct Task {
    job: Job,
    jobs: JobStore,
    state: TaskState,
    scratch: Option<TempDir>,
    child: Option<Child>,
    exit: Option<ExitStatus>,
}

impl Task {
    pub fn new(job: Job, jobs: JobStore) -> Self {
        Self {
            job,
            jobs,
            state: TaskState::Created,
            scratch: None,
            child: None,
            exit: None,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Unpack the job archive into a fresh scratch directory and launch the
    /// payload there, with stdout and stderr going to `output`.
    ///
    /// The child gets the platform restricted to `partition` in
    /// `JOBMESH_PLATFORM` and its job key in `JOBMESH_JOB`.
    pub async fn start(
        &mut self,
        platform: &Platform,
        partition: ResourcePool,
        output: std::fs::File,
    ) -> Result<()> {
        if self.state != TaskState::Created {
            return Err(Error::internal(format!(
                "task for {} already started",
                self.job.key
            )));
        }
        let archive = self.jobs.archive(&self.job).await?;
        let scratch = tempfile::Builder::new().prefix("jobmesh-").tempdir()?;
        archive.extract(scratch.path()).await?;

        let task_platform = platform.for_task(partition, scratch.path().to_path_buf());
        let stderr = output.try_clone()?;
        let child = Command::new(&archive.payload.program)
            .args(&archive.payload.args)
            .envs(&archive.payload.env)
            .env(PLATFORM_ENV, serde_json::to_string(&task_platform)?)
            .env(JOB_ENV, serde_json::to_string(&self.job.key)?)
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn();

        self.scratch = Some(scratch);
        let child = child?;
        tracing::info!(job = %self.job.key, pid = ?child.id(), "task_started");
        self.child = Some(child);
        self.state = TaskState::Running;
        Ok(())
    }

    /// Wait for the child to exit, at most `timeout` when given.
    /// Returns whether it has exited.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.exit.is_some() {
            return Ok(true);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(false);
        };
        let status = match timeout {
            None => child.wait().await?,
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => return Ok(false),
            },
        };
        self.exit = Some(status);
        self.state = TaskState::Exited;
        tracing::info!(job = %self.job.key, status = %status, "task_exited");
        Ok(true)
    }

    /// Stop the child if it is still running and clean up.
    ///
    /// Sends SIGINT, allows `delay` for a graceful exit, then SIGKILLs. An
    /// interrupted restartable job has its scratch state checkpointed into the
    /// job archive before the scratch directory is removed.
    pub async fn release(&mut self, delay: Duration) -> Result<()> {
        if self.state == TaskState::Running && !self.wait(Some(Duration::ZERO)).await? {
            self.state = TaskState::Interrupting;
            if let Some(pid) = self.pid() {
                signal::interrupt(pid)?;
            }
            if !self.wait(Some(delay)).await? {
                tracing::warn!(job = %self.job.key, "task_force_killed");
                if let Some(pid) = self.pid() {
                    signal::kill(pid)?;
                }
                self.wait(None).await?;
            }
        }

        if self.status() == JobStatus::Queued {
            if let Some(dir) = self.scratch_path() {
                if let Err(e) = self.jobs.checkpoint(&self.job.key, dir).await {
                    tracing::warn!("task_checkpoint_failed: job={}, error={}", self.job.key, e);
                }
            }
        }

        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = scratch.close() {
                tracing::warn!("scratch_cleanup_failed: job={}, error={}", self.job.key, e);
            }
        }
        self.state = TaskState::Released;
        Ok(())
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|s| s.code())
    }

    /// Job status implied by the child's exit; `Running` until it exits.
    pub fn status(&self) -> JobStatus {
        let Some(exit) = self.exit else {
            return JobStatus::Running;
        };
        if exit.success() {
            JobStatus::Complete
        } else if interrupted(&exit) {
            if self.job.restart {
                JobStatus::Queued
            } else {
                JobStatus::Timeout
            }
        } else {
            JobStatus::Error
        }
    }
}

fn interrupted(exit: &ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if exit.signal().is_some_and(signal::is_interruption) {
            return true;
        }
    }
    exit.code().is_some_and(signal::is_interruption_code)
}

//! Job status state machine and the typed view of a job record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::selector::ResourceSelector;
use crate::link::LINKS_ATTR;
use crate::store::{Key, Record};
use crate::types::{Error, Result};

/// Attribute names of a job record.
pub mod attrs {
    pub const STATUS: &str = "status";
    pub const ATTEMPTS: &str = "attempts";
    pub const CHECKPOINTS: &str = "checkpoints";
    pub const RESTART: &str = "restart";
    pub const FILE: &str = "file";
    pub const FILES_TABLE: &str = "files_table";
    pub const AGENTS: &str = "agents";
    pub const SELECTOR: &str = "get";
    pub const PATHS: &str = "paths";
    pub const WALLTIME: &str = "walltime";
}

/// Job lifecycle.
///
/// `Unavailable` until the archive upload finishes, then `Queued`. Exactly
/// one agent moves it to `Running`; the task that ran it settles it, or
/// crash recovery and checkpointing restarts put it back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Unavailable,
    Queued,
    Running,
    Complete,
    Error,
    Timeout,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Unavailable => "unavailable",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
            JobStatus::Timeout => "timeout",
        }
    }

    /// Complete and error jobs are never picked up again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        match (self, to) {
            // UNAVAILABLE
            (JobStatus::Unavailable, JobStatus::Queued) => true,
            // QUEUED
            (JobStatus::Queued, JobStatus::Running) => true,
            // RUNNING
            (JobStatus::Running, JobStatus::Complete) => true,
            (JobStatus::Running, JobStatus::Error) => true,
            (JobStatus::Running, JobStatus::Timeout) => true,
            (JobStatus::Running, JobStatus::Queued) => true, // Reclaimed or restarted
            // COMPLETE / ERROR are terminal; TIMEOUT only by resubmission
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unavailable" => Ok(JobStatus::Unavailable),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "complete" => Ok(JobStatus::Complete),
            "error" => Ok(JobStatus::Error),
            "timeout" => Ok(JobStatus::Timeout),
            other => Err(Error::validation(format!("unknown job status: {}", other))),
        }
    }
}

/// Typed view of a job record. The raw record stays available for
/// user-defined attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub key: Key,
    pub status: JobStatus,
    pub attempts: i64,
    pub checkpoints: i64,
    pub restart: bool,
    pub file: Option<String>,
    pub agents: Vec<String>,
    pub paths: Vec<String>,
    pub selector: ResourceSelector,
    pub walltime: f64,
    pub links: Vec<String>,
    pub record: Record,
}

impl TryFrom<Record> for Job {
    type Error = Error;

    fn try_from(record: Record) -> Result<Self> {
        let status = record
            .get_str(attrs::STATUS)
            .ok_or_else(|| Error::inconsistent(format!("job {} has no status", record.key)))?
            .parse()?;
        Ok(Self {
            key: record.key.clone(),
            status,
            attempts: record.get_i64(attrs::ATTEMPTS).unwrap_or(0),
            checkpoints: record.get_i64(attrs::CHECKPOINTS).unwrap_or(0),
            restart: record.get_bool(attrs::RESTART).unwrap_or(false),
            file: record.get_str(attrs::FILE).map(str::to_string),
            agents: record.get_set(attrs::AGENTS),
            paths: record.get_set(attrs::PATHS),
            selector: record.decode(attrs::SELECTOR)?.unwrap_or_default(),
            walltime: record.get_f64(attrs::WALLTIME).unwrap_or(0.0),
            links: record.get_set(LINKS_ATTR),
            record,
        })
    }
}

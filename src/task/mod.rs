//! Per-job task supervision.

pub mod signal;
mod supervisor;

pub use supervisor::{Task, TaskState, JOB_ENV};

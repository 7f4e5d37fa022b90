//! Core types for jobmesh.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (AgentKey, RunId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the store and agent runtime

mod config;
mod errors;
mod ids;

pub use config::{AgentConfig, Config, ObservabilityConfig, RetryPolicy, StoreConfig};
pub use errors::{Error, Result};
pub use ids::{AgentKey, RunId};

//! # Jobmesh - Decentralized Job Coordination
//!
//! Agents on many hosts cooperate through a shared table store instead of a
//! central scheduler:
//! - Conditional updates on single records are the only coordination primitive
//! - Reference-counted blob storage for job archives and captured output
//! - Time-ordered job tables with a `queued → running → complete` lifecycle
//! - Resource pools split among concurrently running tasks and merged back
//! - Heartbeat-based liveness and cleanup of agents that vanish
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────── table store ─────────────────────┐
//!                 │  agents          jobs (ChronoTable)        files (blobs) │
//!                 └────▲──────────────────▲─────────────────────────▲────────┘
//!                      │ register/ping    │ claim (CAS)             │ links
//!                 ┌────┴──────────────────┴─────────┐               │
//!   Platform  →   │  Agent: listen ─▶ accept ─▶ Task ├──────────────┘
//!                 │  heartbeat (detached)           │
//!                 └─────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod agent;
pub mod blob;
pub mod chrono_table;
pub mod cluster;
pub mod job;
pub mod link;
pub mod store;
pub mod task;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};

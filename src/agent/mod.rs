//! Agents: registration, liveness, resource bookkeeping and the listen loop.

mod heartbeat;
pub mod platform;
pub mod registry;
pub mod resources;
mod runtime;

pub use heartbeat::{spawn_heartbeat, HeartbeatExit};
pub use platform::{Platform, PLATFORM_ENV};
pub use registry::{attrs, AgentRegistry, AgentStatus, CleanupReport, WorkItem};
pub use resources::{AgentResources, Demand, Resource, ResourcePool, ResourceRequest};
pub use runtime::{Agent, ExitReason};

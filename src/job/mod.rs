//! Jobs: records, archives, resource selectors and the job table.

pub mod archive;
pub mod selector;
mod store;
mod types;

pub use archive::{JobArchive, JobPayload};
pub use selector::ResourceSelector;
pub use store::{JobSpec, JobStore};
pub use types::{attrs, Job, JobStatus};

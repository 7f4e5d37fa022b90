//! Reference-counted artifact storage.
//!
//! - [`BlobBackend`]: where the bytes live ([`MemoryBlobs`], [`FsBlobs`])
//! - [`BlobStore`]: counts and ownership links kept in a table

mod backend;
mod store;

pub use backend::{BlobBackend, FsBlobs, MemoryBlobs};
pub use store::{BlobInfo, BlobStore, BUCKET_KEY};

/// Sentinel member of every link set, naming the owning record itself.
pub const SELF_LINK: &str = "self";

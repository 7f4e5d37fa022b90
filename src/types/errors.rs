//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. A lost compare-and-swap is never an
//! error: conditional operations report it as `Ok(false)`.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for jobmesh.
#[derive(Error, Debug)]
pub enum Error {
    /// Record or blob does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Insert-if-absent found an existing record.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The table store kept throttling until the backoff budget ran out.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Non-retryable table store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Blob backend failure.
    #[error("blob error: {0}")]
    Blob(String),

    /// Stored state contradicts the caller's bookkeeping.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// A resource request could not be satisfied by a pool.
    #[error("invalid resource request: {0}")]
    InvalidResource(String),

    /// Malformed input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Host provisioning or remote launch failed.
    #[error("provisioning error: {0}")]
    Provision(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

// Convenience constructors
impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn provision(msg: impl Into<String>) -> Self {
        Self::Provision(msg.into())
    }

    pub fn blob(msg: impl Into<String>) -> Self {
        Self::Blob(msg.into())
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    pub fn invalid_resource(msg: impl Into<String>) -> Self {
        Self::InvalidResource(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for lookup misses, which routine checks treat as a plain result.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = Error::inconsistent("job a@1 is queued, expected running");
        assert_eq!(
            err.to_string(),
            "inconsistent state: job a@1 is queued, expected running"
        );
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::not_found("x").is_not_found());
        assert!(!Error::store("x").is_not_found());
    }

    #[test]
    fn test_from_serde_error() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = bad.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}

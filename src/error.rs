//! Error types for ESDM operations

use thiserror::Error;

/// Main error type for ESDM operations
#[derive(Error, Debug)]
pub enum EsdmError {
    /// Bad rank, offset, size, type or a missing required argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No registered backend accepts a fragment's shape.
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Wraps a failure reported by a storage backend.
    #[error("Backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    /// A read would leave part of the destination buffer unfilled.
    #[error("Incomplete data: {0}")]
    IncompleteData(String),

    /// Duplicate name on create.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Commit incomplete: {failed} of {total} fragments still staged")]
    CommitIncomplete { failed: usize, total: usize },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Stored bytes fail header or checksum validation.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EsdmError {
    /// Wrap a backend failure
    pub fn backend(backend: impl Into<String>, message: impl ToString) -> Self {
        EsdmError::Backend {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same call may succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EsdmError::Backend { .. }
                | EsdmError::Io(_)
                | EsdmError::Timeout(_)
                | EsdmError::CommitIncomplete { .. }
        )
    }
}

/// Specialized Result type for ESDM operations
pub type Result<T> = std::result::Result<T, EsdmError>;

impl From<bincode::Error> for EsdmError {
    fn from(err: bincode::Error) -> Self {
        EsdmError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EsdmError {
    fn from(err: serde_json::Error) -> Self {
        EsdmError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EsdmError::backend("p1", "disk full").is_retryable());
        assert!(EsdmError::Timeout("write".into()).is_retryable());
        assert!(!EsdmError::Conflict("mycontainer".into()).is_retryable());
        assert!(!EsdmError::InvalidArgument("rank".into()).is_retryable());
    }

    #[test]
    fn test_backend_message() {
        let err = EsdmError::backend("p1", "disk full");
        assert_eq!(err.to_string(), "Backend 'p1' failed: disk full");
    }
}

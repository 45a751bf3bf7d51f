//! Common error types for mirrorsync.

use thiserror::Error;

/// Top-level error type for mirrorsync operations.
///
/// Expected business outcomes (no match, rejected write, ineligible object)
/// are not errors; they are reported as typed stage results. This type is
/// reserved for faults a caller cannot anticipate.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network or HTTP transport failed.
    #[error("Network error: {0}")]
    Network(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Relational database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Credentials were refused by the remote API.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The remote API denied access to the resource.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another live process holds the batch lock.
    #[error("Locked: {0}")]
    Locked(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".to_string()).is_retryable());
        assert!(Error::Io(std::io::Error::other("broken pipe")).is_retryable());
        assert!(!Error::NotFound("person".to_string()).is_retryable());
        assert!(!Error::Locked("batch".to_string()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::Config("missing profile_id".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing profile_id");
    }
}

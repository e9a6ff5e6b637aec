//! Error types for key/value store operations

use thiserror::Error;

/// Errors that can occur while reading or writing a key/value store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Writing the value would exceed the store's capacity
    #[error("Storage quota exceeded writing {key}: {needed} bytes needed, {limit} bytes allowed")]
    QuotaExceeded {
        key: String,
        needed: usize,
        limit: usize,
    },

    /// Key cannot be used with this backend
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// I/O error from a disk-backed store
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An internal lock was poisoned by a panicking writer
    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for KvError {
    fn from(err: serde_json::Error) -> Self {
        KvError::Serialization(err.to_string())
    }
}

/// Result type for key/value store operations
pub type KvResult<T> = Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: KvError = io_err.into();

        match err {
            KvError::Io(msg) => assert!(msg.contains("read-only")),
            _ => panic!("Expected Io"),
        }
    }

    #[test]
    fn test_quota_message() {
        let err = KvError::QuotaExceeded {
            key: "session-state:a".to_string(),
            needed: 120,
            limit: 100,
        };
        assert_eq!(
            err.to_string(),
            "Storage quota exceeded writing session-state:a: 120 bytes needed, 100 bytes allowed"
        );
    }
}

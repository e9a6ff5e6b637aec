//! Error types for the exam session runtime.
//!
//! Runtime faults (storage, network, remote rejection) are represented as
//! state rather than errors. `SessionError` only covers programmer errors,
//! such as opening a session with no id.

use thiserror::Error;

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced to callers of the session runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A persistence operation was called without a session id.
    #[error("Session id is required")]
    MissingSessionId,

    /// A session was opened without a user id.
    #[error("User id is required")]
    MissingUserId,
}

/// Failure reported by the remote record service.
///
/// Every variant is routed into the offline queue and retried up to the
/// configured bound; the distinction only feeds logs and diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The client is offline or the request never reached the server.
    #[error("Network unavailable: {0}")]
    Transport(String),

    /// The server refused the write (validation, ownership, ...).
    #[error("Remote rejected update: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Whether the server actually answered with a refusal
    pub fn is_rejection(&self) -> bool {
        matches!(self, RemoteError::Rejected(_))
    }
}

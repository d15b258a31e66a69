//! Error types for the gibram engine.
//!
//! One unified error type covers every layer so that any failure can be
//! carried to the wire as a `{ message, code }` pair. We use `thiserror`
//! for automatic `Display` and `Error` trait implementations.
//!
//! ## Categories
//!
//! - **Protocol**: malformed frame, unknown codec, oversized frame
//! - **Auth / Permission / RateLimited**: connection-level rejections
//! - **NotFound / Conflict / Invalid**: data-plane failures
//! - **Integrity**: vector-index structural validation failure
//! - **Io / Corruption**: disk, compression and checksum failures
//! - **State**: operation attempted from the wrong state machine state

use std::io;
use thiserror::Error;

/// Result type alias for gibram operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all gibram layers
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame, unknown codec, frame too large, unsupported command
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Missing or invalid API key
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Authenticated but lacking the required permission
    #[error("permission denied: {0}")]
    Permission(String),

    /// Per-key token bucket exhausted
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// Session, record or trace does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate external ID, title, relationship pair or vector ID
    #[error("conflict: {0}")]
    Conflict(String),

    /// Dimension mismatch, out-of-range parameter, malformed header
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Vector index failed structural validation
    #[error("index integrity violation: {0}")]
    Integrity(String),

    /// I/O error (file operations, network, compression)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Checksum mismatch or undecodable persisted bytes
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Backup already in progress, 2PC transition from the wrong state
    #[error("invalid state: {0}")]
    State(String),
}

impl Error {
    /// Numeric code carried in wire error payloads.
    ///
    /// -1 is reserved for errors that reach the wire without a category.
    pub fn code(&self) -> i32 {
        match self {
            Error::Protocol(_) => 1,
            Error::Auth(_) => 2,
            Error::Permission(_) => 3,
            Error::RateLimited(_) => 4,
            Error::NotFound(_) => 5,
            Error::Conflict(_) => 6,
            Error::Invalid(_) => 7,
            Error::Integrity(_) => 8,
            Error::Io(_) | Error::Corruption(_) => 9,
            Error::State(_) => 10,
        }
    }

    /// True if the error means "the thing you named does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True if the error is a uniqueness violation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Shorthand for a missing-session error.
    pub fn session_not_found(session: &str) -> Error {
        Error::NotFound(format!("session {session:?}"))
    }

    /// Shorthand for an embedding-dimension mismatch.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Error {
        Error::Invalid(format!(
            "embedding dimension mismatch: expected {expected}, got {actual}"
        ))
    }
}

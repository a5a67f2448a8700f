//! Error types for Docraft Core

use std::io::ErrorKind;
use thiserror::Error;

/// Result type alias using Docraft Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replicated document store
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from storage or network operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// Storage-related errors (trees, tables, schemas)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Wire protocol violations (framing, checksum, unexpected message)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer was rejected (stale term)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// A snapshot could not be installed without violating log matching
    #[error("Snapshot integrity error: {0}")]
    SnapshotIntegrity(String),

    /// Replicated log invariant violations
    #[error("Consensus error: {0}")]
    Consensus(String),

    /// Optimistic concurrency violation (etag mismatch)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Invalid caller-supplied argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization / deserialization failures
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The connection or session has been disposed
    #[error("Object disposed: {0}")]
    Disposed(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a snapshot integrity error
    pub fn snapshot_integrity(msg: impl Into<String>) -> Self {
        Self::SnapshotIntegrity(msg.into())
    }

    /// Create a consensus error
    pub fn consensus(msg: impl Into<String>) -> Self {
        Self::Consensus(msg.into())
    }

    /// Create a concurrency error
    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is a normal end of a session (cancellation,
    /// disposal or the peer going away) rather than a fault.
    pub fn is_benign_termination(&self) -> bool {
        match self {
            Self::Cancelled | Self::Disposed(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

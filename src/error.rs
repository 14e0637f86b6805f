//! Error types for the versioning engine.
//!
//! Two channels: [`EngineError`] for everything a caller can get wrong or the
//! engine refuses to do, and [`BackendError`] for failures of the backing
//! store. Write conflicts are neither; they are counted in
//! [`CommitResult`](crate::types::CommitResult).

use thiserror::Error;

/// Failures reported by a backing store collaborator.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Unable to find table for node ID {0}")]
    TableNotFound(u32),

    #[error("Table does not exist: {0}")]
    MissingTable(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Sequence error: {0}")]
    Sequence(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Conflict on feature {feature_id} at version {version}")]
    Conflict { feature_id: String, version: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BackendError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BackendError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BackendError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BackendError::Deserialization(e.to_string())
    }
}

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid ref: {0}")]
    InvalidRef(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl EngineError {
    /// True if the error originated in the backing store.
    pub fn is_backend(&self) -> bool {
        matches!(self, EngineError::Backend(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type for backend collaborators.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

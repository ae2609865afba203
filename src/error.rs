//! Error types for the persistence engine
//!
//! Read failures never surface here: adapters normalise them to `None` and
//! the engine falls back to the field default. Everything else is reported
//! through [`PersistError`] or logged by the writer task.

use thiserror::Error;

/// Failure raised by a storage adapter while writing.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying medium rejected the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Envelope could not be encoded for the medium.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// Embedded database error.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Blocking storage task did not complete.
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors surfaced by the engine API.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to serialize field '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("migration of '{key}' from version {from} failed: {message}")]
    Migration {
        key: String,
        from: u32,
        message: String,
    },

    /// Writer task has shut down; no more writes are accepted.
    #[error("write queue closed")]
    WriteQueueClosed,
}

pub type Result<T, E = PersistError> = std::result::Result<T, E>;

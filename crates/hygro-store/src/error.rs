//! Error types for hygro-store.

use std::path::PathBuf;

/// Result type for hygro-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hygro-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create a storage directory.
    #[error("Failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The backend was used after `close()`.
    #[error("Storage backend is closed")]
    Closed,

    /// A directory name could not be parsed as a partition identifier.
    #[error("Invalid partition identifier: {0}")]
    InvalidPartition(String),

    /// A device address that cannot name a device file.
    #[error("Invalid device address: {0:?}")]
    InvalidDeviceAddress(String),

    /// Timestamp outside the range a backend can represent.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// The operation was interrupted by its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// The write collides with existing state: duplicate device
    /// registration, duplicate pre-key ID, or a self-directed private
    /// room.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The acting user may not perform this operation on this room.
    #[error("Forbidden")]
    Forbidden,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A persisted value failed to decode (corrupt key material or
    /// timestamp).
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

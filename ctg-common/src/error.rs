//! Error surface of the store and configuration layers
//!
//! Worker code maps these onto its retryable/fatal job verdicts: store and
//! I/O trouble is transient and worth retrying, while lifecycle violations,
//! missing records, and corrupt state are payload or invariant problems
//! that no retry can heal.

use thiserror::Error;

/// Result alias used throughout the store and configuration layers
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// SQLite failed while reading or writing pipeline state
    #[error("Relational store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Filesystem failure opening the database or touching source files
    #[error("File access error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON metadata column or outbox payload would not encode or decode
    #[error("Payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Missing or invalid startup configuration; fatal before any
    /// connection is opened
    #[error("Configuration error: {0}")]
    Config(String),

    /// A row that must exist by construction (file id, run id) was absent
    #[error("Missing record: {0}")]
    MissingRecord(String),

    /// A stored value or transition broke a lifecycle invariant, such as a
    /// backwards file-status move or an unknown evidence source tag
    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),

    /// Stored state is corrupt beyond recovery (undecodable run id)
    #[error("Corrupt state: {0}")]
    Corrupt(String),
}

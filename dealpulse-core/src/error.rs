//! Error types for dealpulse-core

use std::time::Duration;

use thiserror::Error;

/// Main error type for the dealpulse-core library
///
/// These errors never reach UI callers of the tracking and autosave entry
/// points; they are routed to an [`ErrorObserver`](crate::observer::ErrorObserver)
/// and swallowed there.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage backend rejected an operation
    #[error("storage error: {0}")]
    Storage(String),

    /// Storage is disabled or missing (private browsing, quota, policy)
    #[error("storage unavailable")]
    StorageUnavailable,

    /// SQLite error from the persistent store
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network-level transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Remote call did not settle within the hard timeout
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// Endpoint answered with a non-2xx status
    #[error("endpoint rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Result type alias for dealpulse-core
pub type Result<T> = std::result::Result<T, Error>;

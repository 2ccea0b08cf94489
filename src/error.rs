use std::io;
use thiserror::Error;

/// Error type for work queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// IO error, e.g. when a worker thread cannot be spawned.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error.
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Error from the sled-backed backlog.
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    /// A pool must have at least one worker.
    #[error("Invalid pool size: {0}")]
    InvalidSize(usize),

    /// The supervisor loop has stopped and no longer accepts events.
    #[error("Supervisor for queue '{0}' is unavailable")]
    SupervisorUnavailable(String),

    /// A persisted backlog entry could not be decoded.
    #[error("Corrupt backlog entry: {0}")]
    CorruptEntry(String),
}

/// Result type alias for work queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

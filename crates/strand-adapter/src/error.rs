use strand_log::LogError;
use thiserror::Error;

/// Errors returned by adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter is closed")]
    Closed,
    #[error("log error: {0}")]
    Log(#[from] LogError),
    #[error("\"{0}\" is a reserved event name")]
    ReservedEvent(String),
}

/// Failure of a fan-out request.
#[derive(Debug, Error)]
pub enum RequestError<T> {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    /// Not every expected peer answered before the deadline.
    #[error("timeout reached: only {received} responses received out of {expected}")]
    Timeout {
        received: usize,
        expected: usize,
        /// Responses collected before the deadline, local ones included.
        partial: Vec<T>,
    },
}

/// Failure of a session restore.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("invalid offset: {0}")]
    InvalidOffset(String),
    #[error("session or offset not found")]
    SessionNotFound,
    #[error("restore failed: {0}")]
    Io(#[source] LogError),
}

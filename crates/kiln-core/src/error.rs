use std::io;
use thiserror::Error;

/// Central error type for the kiln engine.
///
/// Protocol and resource failures are not errors at this level: they are
/// answered with a status code (see [`crate::parser::ParseOutcome`] and
/// [`crate::resource::Resolution`]). What remains are transport, capacity
/// and setup failures.
#[derive(Debug, Error)]
pub enum KilnError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The worker queue reached its capacity; the task was not accepted.
    #[error("task queue is full")]
    QueueFull,

    /// The pool has been shut down and no longer accepts tasks.
    #[error("thread pool is shut down")]
    PoolShutdown,

    /// The connection table cannot hold this descriptor or the live
    /// connection limit was reached.
    #[error("connection table is full")]
    TableFull,

    /// Invalid server configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl KilnError {
    /// `true` for transient capacity failures that are answered by closing
    /// the affected connection rather than stopping the server.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            KilnError::QueueFull | KilnError::TableFull | KilnError::PoolShutdown
        )
    }
}

pub type KilnResult<T> = Result<T, KilnError>;

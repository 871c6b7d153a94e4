//! Error types for the directory change watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors returned synchronously by watcher operations.
///
/// Failures that happen after a watch is running are never returned from a
/// call; they reach the handler through
/// [`DirectoryChangeHandler::on_read_directory_changes_error`](crate::DirectoryChangeHandler::on_read_directory_changes_error).
#[derive(Error, Debug)]
pub enum WatcherError {
    /// A required argument was empty or out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The path does not exist or is not a directory.
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// An include or exclude pattern failed to compile.
    #[error("invalid filter pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// Opening the directory for change notifications failed.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The dispatch thread could not be started.
    #[error("failed to start dispatch thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WatcherError {
    /// The operating system error code behind this error, if there is one.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            WatcherError::Io(err) | WatcherError::ThreadSpawn(err) => err.raw_os_error(),
            WatcherError::Notify(err) => match &err.kind {
                notify::ErrorKind::Io(err) => err.raw_os_error(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether the error was caused by the caller's arguments rather than by
    /// the system.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            WatcherError::InvalidParameter(_)
                | WatcherError::NotADirectory(_)
                | WatcherError::InvalidPattern { .. }
        )
    }
}

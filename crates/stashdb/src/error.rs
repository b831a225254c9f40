//! Error types for stashdb

use std::io;
use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type alias for stashdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The index stayed contended for the whole retry budget.
    Busy,
    /// A value could not be encoded or decoded.
    Serialization,
    /// Directory unreachable, disk full, permission denied, store failure.
    Storage,
    /// A lock or semaphore was not acquired before its deadline.
    SyncTimeout,
    /// Index and blob tree disagree.
    Consistency,
    /// The caller misused an API (bad settings, releasing what it does not hold).
    Usage,
}

/// Error types for cache operations
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying store stayed locked after every retry
    #[error("index busy after {attempts} attempt(s)")]
    Busy {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error on the cache directory
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Non-transient failure reported by SQLite
    #[error("index error: {0}")]
    Index(rusqlite::Error),

    /// Blob file or index content could not be parsed
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Lock or semaphore acquisition timed out
    #[error("timed out after {waited:?} waiting for '{name}'")]
    SyncTimeout {
        /// Name of the lock or semaphore.
        name: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// Release attempted by a caller that does not hold the lock
    #[error("lock '{name}' is not held by this holder")]
    NotHeld {
        /// Name of the lock.
        name: String,
    },

    /// Semaphore released more times than it was acquired
    #[error("semaphore '{name}' already has all {max} permits available")]
    SemaphoreFull {
        /// Name of the semaphore.
        name: String,
        /// Configured maximum.
        max: u32,
    },

    /// Index references a blob that never showed up
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Invalid settings
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Busy { .. } => ErrorKind::Busy,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Io(_) | Error::Index(_) | Error::Corrupt(_) => ErrorKind::Storage,
            Error::SyncTimeout { .. } => ErrorKind::SyncTimeout,
            Error::Consistency(_) => ErrorKind::Consistency,
            Error::NotHeld { .. } | Error::SemaphoreFull { .. } | Error::Config(_) => {
                ErrorKind::Usage
            }
        }
    }

    /// True when retrying later may succeed.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Error::Busy { attempts: 1 }
            }
            _ => Error::Index(err),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::Corrupt(format!("{:?}", err.map_input(|input| input.len())))
    }
}

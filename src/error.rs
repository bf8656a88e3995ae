//! Error types for the session storage engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Failures surfaced by the storage engine.
///
/// Lock and I/O failures are never retried inside the engine; callers decide
/// whether to back off and retry (see [`StorageError::is_retryable`]).
#[derive(Error, Debug)]
pub enum StorageError {
    /// A session or index lock could not be acquired within the timeout.
    #[error("timed out after {waited:?} waiting for lock on {resource}")]
    LockTimeout { resource: String, waited: Duration },

    /// Delete attempted while a writer still owns the session.
    #[error("session {0} is active; finalize it before deleting")]
    SessionBusy(String),

    /// Open-for-write attempted on a session that already has a writer.
    #[error("session {0} already has an active writer")]
    AlreadyActive(String),

    /// Underlying storage read/write failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("session {0} not found")]
    NotFound(String),

    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),

    /// Append attempted on a writer that was already finalized.
    #[error("session {0} has been finalized")]
    SessionClosed(String),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Contention errors that may succeed if the caller tries again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::SessionBusy(_))
    }
}

pub(crate) trait IoResultExt<T> {
    fn io_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoResultExt<T> for std::result::Result<T, io::Error> {
    fn io_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| StorageError::io(context(), source))
    }
}

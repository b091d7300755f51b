//! Error taxonomy for the tracker.
//!
//! [`Error`] covers failures that are surfaced to callers. Everything the
//! extractor notices about a malformed advertisement is reported as an
//! [`ExtractionWarning`] instead: those never abort processing.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Radio off, permission denied, adapter missing.
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("{operation} on {address} timed out after {timeout:?}")]
    ReadTimeout {
        address: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("read of handle {handle:#06x} on {address} failed: {reason}")]
    ReadFailed {
        address: String,
        handle: u16,
        reason: String,
    },

    /// Transient: the write may succeed later.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store refused the operation and will keep refusing it.
    #[error("store error: {0}")]
    Store(String),

    #[error("advertisement carries no address")]
    MissingAddress,

    #[error("unknown device id {0}")]
    UnknownDevice(i64),

    #[error("table {table} has no column {column}")]
    InvalidColumn { table: String, column: String },

    #[error("background task failed: {0}")]
    TaskFailed(String),

    /// Unreadable settings or reference data files.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull,
            ) => Error::StoreUnavailable(err.to_string()),
            _ => Error::Store(err.to_string()),
        }
    }
}

/// Non-fatal findings of the attribute extractor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionWarning {
    /// Keys the extractor does not know. The values are dropped.
    #[error("MISSED PROPS({address}): {keys:?}")]
    UnrecognizedProperties { address: String, keys: Vec<String> },

    /// A recognized key carried a value of the wrong shape. The field is dropped.
    #[error("property {key} of {address} is malformed, expected {expected}")]
    MalformedProperty {
        address: String,
        key: String,
        expected: &'static str,
    },

    /// The two independently sourced copies of a field disagree. Both are kept.
    #[error("{field}s don't match: {primary} - {redundant}")]
    IdentityMismatch {
        field: &'static str,
        primary: String,
        redundant: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_database_is_transient() {
        assert!(matches!(
            Error::from(sqlite_failure(ffi::SQLITE_BUSY)),
            Error::StoreUnavailable(_)
        ));
        assert!(matches!(
            Error::from(sqlite_failure(ffi::SQLITE_FULL)),
            Error::StoreUnavailable(_)
        ));
    }

    #[test]
    fn test_rejected_statement_is_permanent() {
        assert!(matches!(
            Error::from(sqlite_failure(ffi::SQLITE_CONSTRAINT)),
            Error::Store(_)
        ));
        assert!(matches!(
            Error::from(sqlite_failure(ffi::SQLITE_TOOBIG)),
            Error::Store(_)
        ));
        assert!(matches!(
            Error::from(rusqlite::Error::QueryReturnedNoRows),
            Error::Store(_)
        ));
    }
}

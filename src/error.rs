//! Error kinds carried by the engine core.
//!
//! Every fallible operation in the library returns [`EngineError`], which
//! classifies failures into the handful of kinds the callers actually branch
//! on: bad input is never retried, transient storage failures are retried
//! once inside the batch, corruption triggers recovery, and fatal errors
//! disable the subsystem.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Validation failure (event, config, normalize). Surfaced to the
    /// caller, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Daemon lock busy, queue full, timeout exceeded. Observable via
    /// counters; does not abort the caller.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// An individual storage operation failed. Retried once within the
    /// same batch transaction.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Integrity violation detected in the store. Triggers recovery
    /// rotation when enabled.
    #[error("store corrupt: {0}")]
    Corrupt(String),

    /// Unrecoverable store error: disk full, permission denied, schema
    /// newer than this build.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, EngineError::Corrupt(_))
    }

    /// Semantic errors affect a single row and must not abort the rest of
    /// a batch; everything else is treated as transactional.
    pub fn is_semantic(&self) -> bool {
        matches!(self, EngineError::InvalidInput(_))
    }
}

/// Classify a SQLite error into an engine error kind.
///
/// The interesting cases are the corruption family (malformed image, not a
/// database), which routes into recovery, and the fatal family (permission,
/// disk full), which does not.
pub fn classify_sqlite(err: rusqlite::Error) -> EngineError {
    use rusqlite::ErrorCode;

    match &err {
        rusqlite::Error::SqliteFailure(code, _) => match code.code {
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                EngineError::Corrupt(err.to_string())
            }
            ErrorCode::PermissionDenied | ErrorCode::ReadOnly | ErrorCode::DiskFull => {
                EngineError::Fatal(err.to_string())
            }
            ErrorCode::CannotOpen => EngineError::Fatal(err.to_string()),
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                EngineError::ResourceUnavailable(err.to_string())
            }
            ErrorCode::ConstraintViolation => EngineError::InvalidInput(err.to_string()),
            _ => EngineError::Transient(err.to_string()),
        },
        // Row-level conversion problems are semantic: one malformed row
        // must not take the batch down with it.
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::IntegralValueOutOfRange(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::ToSqlConversionFailure(_) => {
            EngineError::InvalidInput(err.to_string())
        }
        _ => EngineError::Transient(err.to_string()),
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        classify_sqlite(err)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => EngineError::Fatal(err.to_string()),
            ErrorKind::WouldBlock => EngineError::ResourceUnavailable(err.to_string()),
            // ENOSPC surfaces as a raw OS error, not a stable ErrorKind.
            _ if err.raw_os_error() == Some(28) => EngineError::Fatal(err.to_string()),
            _ => EngineError::Transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn corruption_codes_classify_as_corrupt() {
        assert!(classify_sqlite(sqlite_failure(ffi::SQLITE_CORRUPT)).is_corrupt());
        assert!(classify_sqlite(sqlite_failure(ffi::SQLITE_NOTADB)).is_corrupt());
    }

    #[test]
    fn busy_is_resource_unavailable() {
        let err = classify_sqlite(sqlite_failure(ffi::SQLITE_BUSY));
        assert!(matches!(err, EngineError::ResourceUnavailable(_)));
    }

    #[test]
    fn constraint_violation_is_semantic() {
        let err = classify_sqlite(sqlite_failure(ffi::SQLITE_CONSTRAINT));
        assert!(err.is_semantic());
    }

    #[test]
    fn disk_full_is_fatal() {
        let err = classify_sqlite(sqlite_failure(ffi::SQLITE_FULL));
        assert!(matches!(err, EngineError::Fatal(_)));
    }
}

//! Error taxonomy for the POS core.
//!
//! Every fallible operation returns `PosResult<T>`. Callers branch on the
//! variant: `Validation` and `Conflict` are user-correctable, `NotFound` maps
//! to a missing-record message, `Database` is transient infrastructure and
//! safe to retry after the busy timeout.

use serde::Serialize;
use thiserror::Error;

pub type PosResult<T> = Result<T, PosError>;

#[derive(Debug, Error, Serialize)]
#[serde(tag = "kind", content = "message")]
pub enum PosError {
    /// Caller-supplied input violates a business rule.
    #[error("{0}")]
    Validation(String),

    /// The operation contradicts current persistent state (double refund,
    /// second open shift, duplicate phone, ...).
    #[error("{0}")]
    Conflict(String),

    /// The referenced record does not exist.
    #[error("{0}")]
    NotFound(String),

    /// SQLite-level failure. Transient from the caller's point of view.
    #[error("database error: {0}")]
    Database(String),
}

impl PosError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PosError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        PosError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        PosError::NotFound(msg.into())
    }

    /// Wrap a rusqlite error with the statement context
    /// ("insert sale: UNIQUE constraint failed ...").
    pub fn db(context: &str, err: rusqlite::Error) -> Self {
        PosError::Database(format!("{context}: {err}"))
    }
}

impl From<rusqlite::Error> for PosError {
    fn from(err: rusqlite::Error) -> Self {
        PosError::Database(err.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

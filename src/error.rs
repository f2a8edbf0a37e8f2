//! Crate-wide error type.
//!
//! One top-level variant per error category: callers branch on category
//! rather than parsing message text. Storage-specific detail nests under
//! `Error::Storage` instead of flattening into the top level, so the
//! category set stays exactly the documented eight.

use std::fmt;
use std::io;

/// A location in the original SQL text, when one can be derived from the AST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSpan {
    pub offset: usize,
    pub len: usize,
}

/// Failures originating in a KV substrate or virtual-table module.
#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    KeyTooLarge(usize),
    ValueTooLarge(usize),
    FileLocked(String),
    Corrupted(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "I/O error: {err}"),
            StorageError::KeyTooLarge(size) => write!(f, "key too large: {size} bytes"),
            StorageError::ValueTooLarge(size) => write!(f, "value too large: {size} bytes"),
            StorageError::FileLocked(msg) => write!(f, "database file is locked: {msg}"),
            StorageError::Corrupted(msg) => write!(f, "database corrupted: {msg}"),
        }
    }
}

/// Crate-wide error type. Each top-level variant is one error category.
#[derive(Debug)]
pub enum Error {
    /// Lexing/parsing failed.
    Syntax(String),
    /// Unknown table/column, ambiguous column, or type mismatch at plan time.
    Schema(String),
    /// CHECK/PK/UNIQUE/NOT NULL violation, surfaced at DML time or (if deferred) at COMMIT.
    Constraint { message: String, deferred: bool },
    /// Storage-level PK/UNIQUE conflict not suppressed by ON CONFLICT.
    Conflict(String),
    /// API precondition violated (e.g. UPDATE without old PK, commit outside a transaction).
    Misuse(String),
    /// Underlying KV substrate or module failure.
    Storage(StorageError),
    /// Invariant broken inside the engine; a bug signal.
    Internal(String),
    /// Cancellation was requested.
    Cancelled,
}

impl Error {
    pub fn syntax(msg: impl Into<String>) -> Self {
        Error::Syntax(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Error::Constraint { message: msg.into(), deferred: false }
    }

    pub fn deferred_constraint(msg: impl Into<String>) -> Self {
        Error::Constraint { message: msg.into(), deferred: true }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        Error::Misuse(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Error::Storage(StorageError::Corrupted(msg.into()))
    }

    /// True for `Constraint` errors raised during coordinated commit, which
    /// per the error-handling policy must roll back every connection before
    /// being re-raised, even inside an explicit transaction.
    pub fn is_commit_time_constraint(&self) -> bool {
        matches!(self, Error::Constraint { deferred: true, .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Syntax(msg) => write!(f, "syntax error: {msg}"),
            Error::Schema(msg) => write!(f, "schema error: {msg}"),
            Error::Constraint { message, deferred } => {
                if *deferred {
                    write!(f, "deferred constraint violation: {message}")
                } else {
                    write!(f, "constraint violation: {message}")
                }
            }
            Error::Conflict(msg) => write!(f, "conflict: {msg}"),
            Error::Misuse(msg) => write!(f, "misuse: {msg}"),
            Error::Storage(err) => write!(f, "storage error: {err}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(StorageError::Io(err)) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Storage(StorageError::Io(err))
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

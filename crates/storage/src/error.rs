//! Storage error type shared across all repository implementations.

use std::fmt;

/// Errors from a storage backend.
///
/// Covers real backend failures; input validation belongs at the call site
/// before the storage layer is reached.
#[derive(Debug)]
pub enum StorageError {
    /// A concurrent writer won the race for this row. Re-read and retry.
    TransactionConflict,

    /// The requested row does not exist (or was already consumed).
    NotFound,

    /// The row exists but is not in a state that permits the operation
    /// (e.g. locking a leaf that is not `Available`).
    InvalidState(&'static str),

    /// A uniqueness or reference constraint was violated.
    ConstraintViolation(&'static str),

    /// Encoding or decoding a stored value failed.
    Serialization(String),

    /// A row lock was not acquired within the statement timeout.
    Timeout,

    /// An unclassified backend error.
    Internal(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransactionConflict => write!(f, "transaction conflict"),
            Self::NotFound => write!(f, "row not found"),
            Self::InvalidState(detail) => write!(f, "invalid row state: {detail}"),
            Self::ConstraintViolation(detail) => write!(f, "constraint violation: {detail}"),
            Self::Serialization(detail) => write!(f, "serialization error: {detail}"),
            Self::Timeout => write!(f, "row lock timed out"),
            Self::Internal(detail) => write!(f, "internal storage error: {detail}"),
        }
    }
}

impl std::error::Error for StorageError {}

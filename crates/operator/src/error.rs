//! Operator error surface.
//!
//! [`OperatorError`] carries exactly the error kinds callers see; every
//! handler maps storage, crypto, and RPC failures into one of them before
//! returning. The conversion to [`tonic::Status`] is the wire mapping.

use std::fmt;

use storage::StorageError;
use transport::RpcError;

/// Errors surfaced by operator handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorError {
    /// Malformed request: empty leaf list, bad uuid, mismatched
    /// signing-key derivation, invalid tweak material.
    InvalidArgument(&'static str),

    /// Identity mismatch or authorization failure.
    PermissionDenied(&'static str),

    /// Unknown leaf, transfer, or nonce commitment.
    NotFound(&'static str),

    /// The row exists but the operation is not allowed in its state:
    /// leaf not available, wrong transfer status, insufficient
    /// confirmations, expired.
    FailedPrecondition(&'static str),

    /// A concurrent claim won the race.
    Conflict(&'static str),

    /// Operator partial failure; safe to retry.
    Aborted(&'static str),

    /// Invariant violation; the transfer is left in its last consistent
    /// state.
    Internal(&'static str),
}

impl OperatorError {
    /// The gRPC status code this error maps to.
    pub fn code(&self) -> tonic::Code {
        match self {
            Self::InvalidArgument(_) => tonic::Code::InvalidArgument,
            Self::PermissionDenied(_) => tonic::Code::PermissionDenied,
            Self::NotFound(_) => tonic::Code::NotFound,
            Self::FailedPrecondition(_) => tonic::Code::FailedPrecondition,
            Self::Conflict(_) => tonic::Code::Aborted,
            Self::Aborted(_) => tonic::Code::Unavailable,
            Self::Internal(_) => tonic::Code::Internal,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::InvalidArgument(m)
            | Self::PermissionDenied(m)
            | Self::NotFound(m)
            | Self::FailedPrecondition(m)
            | Self::Conflict(m)
            | Self::Aborted(m)
            | Self::Internal(m) => m,
        }
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::InvalidArgument(_) => "invalid argument",
            Self::PermissionDenied(_) => "permission denied",
            Self::NotFound(_) => "not found",
            Self::FailedPrecondition(_) => "failed precondition",
            Self::Conflict(_) => "conflict",
            Self::Aborted(_) => "aborted",
            Self::Internal(_) => "internal",
        };
        write!(f, "{kind}: {}", self.message())
    }
}

impl std::error::Error for OperatorError {}

impl From<OperatorError> for tonic::Status {
    fn from(err: OperatorError) -> Self {
        tonic::Status::new(err.code(), err.message())
    }
}

impl From<StorageError> for OperatorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TransactionConflict => Self::Conflict("row contention"),
            StorageError::NotFound => Self::NotFound("row not found"),
            StorageError::InvalidState(detail) => Self::FailedPrecondition(detail),
            StorageError::ConstraintViolation(detail) => Self::FailedPrecondition(detail),
            StorageError::Timeout => Self::Aborted("row lock timed out"),
            StorageError::Serialization(_) | StorageError::Internal(_) => {
                Self::Internal("storage failure")
            }
        }
    }
}

impl From<RpcError> for OperatorError {
    fn from(err: RpcError) -> Self {
        match &err {
            RpcError::UnknownOperator(_) | RpcError::InvalidEndpoint { .. } => {
                Self::Internal("misconfigured federation")
            }
            RpcError::Status { code, .. } => {
                if err.is_transient() {
                    Self::Aborted("operator unavailable")
                } else {
                    match code {
                        tonic::Code::InvalidArgument => Self::InvalidArgument("rejected by operator"),
                        tonic::Code::PermissionDenied => Self::PermissionDenied("rejected by operator"),
                        tonic::Code::NotFound => Self::NotFound("rejected by operator"),
                        tonic::Code::FailedPrecondition => {
                            Self::FailedPrecondition("rejected by operator")
                        }
                        _ => Self::Internal("operator failure"),
                    }
                }
            }
        }
    }
}

impl From<spark_crypto::frost::FrostError> for OperatorError {
    fn from(_: spark_crypto::frost::FrostError) -> Self {
        Self::Internal("threshold signing failure")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_kinds() {
        assert_eq!(
            OperatorError::InvalidArgument("x").code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            OperatorError::FailedPrecondition("x").code(),
            tonic::Code::FailedPrecondition
        );
        assert_eq!(OperatorError::Conflict("x").code(), tonic::Code::Aborted);
    }

    #[test]
    fn storage_errors_map_to_caller_kinds() {
        assert!(matches!(
            OperatorError::from(StorageError::NotFound),
            OperatorError::NotFound(_)
        ));
        assert!(matches!(
            OperatorError::from(StorageError::InvalidState("leaf not available")),
            OperatorError::FailedPrecondition("leaf not available")
        ));
        assert!(matches!(
            OperatorError::from(StorageError::TransactionConflict),
            OperatorError::Conflict(_)
        ));
    }

    #[test]
    fn transient_rpc_errors_become_aborted() {
        let transient = RpcError::Status {
            code: tonic::Code::Unavailable,
            message: "down".into(),
        };
        assert!(matches!(OperatorError::from(transient), OperatorError::Aborted(_)));

        let precondition = RpcError::failed_precondition("leaf not available");
        assert!(matches!(
            OperatorError::from(precondition),
            OperatorError::FailedPrecondition(_)
        ));
    }
}

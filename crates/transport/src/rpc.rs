//! The fan-out seam between the coordinator orchestrator and follower
//! operators.
//!
//! [`FollowerClient`] is the only way the core reaches another operator:
//! one method per internal RPC, addressed by operator id. The gRPC-backed
//! implementation lives in [`crate::grpc`]; tests and the simnet binary
//! use an in-process implementation that calls follower handlers directly.

use std::fmt;
use std::future::Future;

use crate::internal;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors from an internal RPC.
#[derive(Debug, Clone)]
pub enum RpcError {
    /// The operator id is not part of this federation.
    UnknownOperator(String),

    /// The endpoint URL could not be parsed.
    InvalidEndpoint { url: String, reason: String },

    /// The remote returned an error status.
    Status { code: tonic::Code, message: String },
}

impl RpcError {
    /// Build from a tonic status.
    pub fn from_status(status: tonic::Status) -> Self {
        Self::Status {
            code: status.code(),
            message: status.message().to_owned(),
        }
    }

    /// Shorthand for a remote precondition failure (used by in-process
    /// transports to mirror real handler errors).
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::Status {
            code: tonic::Code::FailedPrecondition,
            message: message.into(),
        }
    }

    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UnknownOperator(_) | Self::InvalidEndpoint { .. } => false,
            Self::Status { code, .. } => matches!(
                code,
                tonic::Code::Unavailable
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::Aborted
                    | tonic::Code::Unknown
            ),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperator(id) => write!(f, "unknown operator: {id}"),
            Self::InvalidEndpoint { url, reason } => {
                write!(f, "invalid endpoint '{url}': {reason}")
            }
            Self::Status { code, message } => write!(f, "rpc error ({code}): {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Client side of the internal operator service.
///
/// Object safety is not needed -- orchestrator code is generic over the
/// client -- so methods return `impl Future` and require `Send` bounds for
/// use inside spawned tasks.
pub trait FollowerClient: Send + Sync {
    /// Ask a follower to lock leaves and persist a new transfer.
    fn initiate_transfer(
        &self,
        operator_id: &str,
        request: internal::InitiateTransferInternal,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Cooperative-exit variant of [`Self::initiate_transfer`].
    fn initiate_cooperative_exit(
        &self,
        operator_id: &str,
        request: internal::InitiateCooperativeExitInternal,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Compensating rollback of a transfer (cancel or expire).
    fn rollback_transfer(
        &self,
        operator_id: &str,
        request: internal::RollbackTransferInternal,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Deliver key tweaks for verification and transactional application.
    fn apply_tweaks(
        &self,
        operator_id: &str,
        request: internal::ApplyTweaksInternal,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Distribute verified final refund signatures at claim finalize.
    fn settle_claim(
        &self,
        operator_id: &str,
        request: internal::SettleClaimInternal,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// FROST commit round: reserve nonce pairs, return commitments.
    fn frost_commit(
        &self,
        operator_id: &str,
        request: internal::FrostCommitRequest,
    ) -> impl Future<Output = Result<internal::FrostCommitResponse, RpcError>> + Send;

    /// FROST sign round: consume nonces, return partial signatures.
    fn frost_sign(
        &self,
        operator_id: &str,
        request: internal::FrostSignRequest,
    ) -> impl Future<Output = Result<internal::FrostSignResponse, RpcError>> + Send;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let unavailable = RpcError::Status {
            code: tonic::Code::Unavailable,
            message: "connection refused".into(),
        };
        assert!(unavailable.is_transient());

        let precondition = RpcError::failed_precondition("leaf not available");
        assert!(!precondition.is_transient());

        assert!(!RpcError::UnknownOperator("9".into()).is_transient());
    }

    #[test]
    fn status_conversion_preserves_code_and_message() {
        let status = tonic::Status::not_found("no such transfer");
        let err = RpcError::from_status(status);
        match err {
            RpcError::Status { code, message } => {
                assert_eq!(code, tonic::Code::NotFound);
                assert_eq!(message, "no such transfer");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

//! Wire messages for the operator-to-operator fan-out service.
//!
//! These mirror the user-facing operations (`spark.internal.
//! SparkInternalService`): the coordinator drives followers through
//! transfer initiation, rollback, tweak application, the two FROST rounds,
//! and claim settlement. Secret key material never appears in these
//! messages -- only commitments, proofs, and signature shares do.

use prost::bytes::Bytes;

use crate::spark::{LeafTweakProto, RefundSignature, SigningCommitmentProto};

/// Empty response for acknowledgement-only RPCs.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

// ---------------------------------------------------------------------------
// Transfer initiation / rollback
// ---------------------------------------------------------------------------

/// Per-leaf payload of an internal transfer initiation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiateLeaf {
    #[prost(string, tag = "1")]
    pub leaf_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub cpfp_refund_tx: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub direct_refund_tx: Bytes,
    #[prost(bytes = "bytes", tag = "4")]
    pub direct_from_cpfp_refund_tx: Bytes,
    #[prost(bytes = "bytes", tag = "5")]
    pub secret_cipher: Bytes,
    #[prost(bytes = "bytes", tag = "6")]
    pub signature: Bytes,
}

/// Coordinator asks a follower to lock leaves and persist a transfer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiateTransferInternal {
    #[prost(string, tag = "1")]
    pub transfer_id: String,
    #[prost(int32, tag = "2")]
    pub transfer_type: i32,
    #[prost(message, optional, tag = "3")]
    pub expiry_time: Option<::prost_types::Timestamp>,
    #[prost(bytes = "bytes", tag = "4")]
    pub sender_identity_pubkey: Bytes,
    #[prost(bytes = "bytes", tag = "5")]
    pub receiver_identity_pubkey: Bytes,
    #[prost(int32, tag = "6")]
    pub network: i32,
    #[prost(message, repeated, tag = "7")]
    pub leaves: Vec<InitiateLeaf>,
    #[prost(bytes = "bytes", tag = "8")]
    pub payment_hash: Bytes,
}

/// Cooperative-exit variant: transfer initiation plus exit bookkeeping.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiateCooperativeExitInternal {
    #[prost(message, optional, tag = "1")]
    pub transfer: Option<InitiateTransferInternal>,
    #[prost(string, tag = "2")]
    pub exit_id: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub exit_txid: Bytes,
}

/// Compensating rollback: release leaf locks, terminate the transfer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RollbackTransferInternal {
    #[prost(string, tag = "1")]
    pub transfer_id: String,
    /// Terminal status to record: `true` for expiry, `false` for cancel.
    #[prost(bool, tag = "2")]
    pub expired: bool,
}

// ---------------------------------------------------------------------------
// Tweak application
// ---------------------------------------------------------------------------

/// Coordinator forwards key tweaks for local verification and application.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplyTweaksInternal {
    #[prost(string, tag = "1")]
    pub transfer_id: String,
    /// Identity the tweak came from (sender or claiming receiver).
    #[prost(bytes = "bytes", tag = "2")]
    pub caller_identity_pubkey: Bytes,
    #[prost(message, repeated, tag = "3")]
    pub leaf_tweaks: Vec<LeafTweakProto>,
    /// Final refund signatures accompanying a sender tweak, if any.
    #[prost(message, repeated, tag = "4")]
    pub refund_signatures: Vec<RefundSignature>,
    /// `false` for the sender-side rotation, `true` for the receiver's.
    #[prost(bool, tag = "5")]
    pub receiver_side: bool,
}

/// Per-leaf payload of a claim settlement: the receiver's new refund
/// transactions and their verified aggregate signatures.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SettleLeaf {
    #[prost(string, tag = "1")]
    pub leaf_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub cpfp_refund_tx: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub direct_refund_tx: Bytes,
    #[prost(bytes = "bytes", tag = "4")]
    pub direct_from_cpfp_refund_tx: Bytes,
    #[prost(message, optional, tag = "5")]
    pub signature: Option<RefundSignature>,
}

/// Coordinator distributes verified final signatures at claim finalize.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SettleClaimInternal {
    #[prost(string, tag = "1")]
    pub transfer_id: String,
    #[prost(message, repeated, tag = "2")]
    pub leaves: Vec<SettleLeaf>,
}

// ---------------------------------------------------------------------------
// FROST rounds
// ---------------------------------------------------------------------------

/// Commit round: reserve one nonce pair per job.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrostCommitJob {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(string, tag = "2")]
    pub keyshare_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrostCommitRequest {
    #[prost(message, repeated, tag = "1")]
    pub jobs: Vec<FrostCommitJob>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobCommitment {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(message, optional, tag = "2")]
    pub commitment: Option<SigningCommitmentProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrostCommitResponse {
    #[prost(message, repeated, tag = "1")]
    pub commitments: Vec<JobCommitment>,
}

/// One participant's commitment within a sign-round job.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantCommitment {
    /// Zero-based federation index of the operator.
    #[prost(uint32, tag = "1")]
    pub operator_index: u32,
    #[prost(message, optional, tag = "2")]
    pub commitment: Option<SigningCommitmentProto>,
}

/// Sign round: consume the reserved nonce, produce a partial signature.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrostSignJob {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(string, tag = "2")]
    pub keyshare_id: String,
    /// The 32-byte sighash being signed.
    #[prost(bytes = "bytes", tag = "3")]
    pub message: Bytes,
    /// The leaf's joint verifying public key.
    #[prost(bytes = "bytes", tag = "4")]
    pub verifying_pubkey: Bytes,
    /// Commitments of every operator in the signing set.
    #[prost(message, repeated, tag = "5")]
    pub operator_commitments: Vec<ParticipantCommitment>,
    /// The user participant's commitment.
    #[prost(message, optional, tag = "6")]
    pub user_commitment: Option<SigningCommitmentProto>,
    /// The receiving operator's own commitment, identifying the pooled
    /// nonce to consume.
    #[prost(message, optional, tag = "7")]
    pub self_commitment: Option<SigningCommitmentProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrostSignRequest {
    #[prost(message, repeated, tag = "1")]
    pub jobs: Vec<FrostSignJob>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobSignatureShare {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub signature_share: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FrostSignResponse {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<JobSignatureShare>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn initiate_transfer_roundtrip() {
        let request = InitiateTransferInternal {
            transfer_id: "t1".into(),
            transfer_type: 0,
            expiry_time: Some(::prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
            sender_identity_pubkey: Bytes::from_static(&[0x02; 33]),
            receiver_identity_pubkey: Bytes::from_static(&[0x03; 33]),
            network: 2,
            leaves: vec![InitiateLeaf {
                leaf_id: "leaf-1".into(),
                cpfp_refund_tx: Bytes::from_static(&[0xAA]),
                ..Default::default()
            }],
            payment_hash: Bytes::new(),
        };

        let decoded =
            InitiateTransferInternal::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn frost_sign_job_roundtrip() {
        let job = FrostSignJob {
            job_id: "j1".into(),
            keyshare_id: "ks-1".into(),
            message: Bytes::from_static(&[0x11; 32]),
            verifying_pubkey: Bytes::from_static(&[0x02; 33]),
            operator_commitments: vec![ParticipantCommitment {
                operator_index: 1,
                commitment: Some(SigningCommitmentProto {
                    hiding: Bytes::from_static(&[0x02; 33]),
                    binding: Bytes::from_static(&[0x03; 33]),
                }),
            }],
            user_commitment: None,
            self_commitment: None,
        };
        let request = FrostSignRequest { jobs: vec![job] };
        let decoded = FrostSignRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, request);
    }
}

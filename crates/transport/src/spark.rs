//! Wire messages for the user-facing operator service.
//!
//! Hand-maintained prost message definitions, mirroring
//! `spark.SparkService`. Byte fields use [`bytes::Bytes`] so responses
//! share buffers instead of copying.

use std::collections::HashMap;

use prost::bytes::Bytes;

// ---------------------------------------------------------------------------
// Shared building blocks
// ---------------------------------------------------------------------------

/// A FROST signing commitment: two 33-byte compressed points.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SigningCommitmentProto {
    #[prost(bytes = "bytes", tag = "1")]
    pub hiding: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub binding: Bytes,
}

/// One verifiable secret share: the 32-byte share value plus Feldman
/// proofs (compressed points, one per polynomial coefficient).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SecretShareProto {
    #[prost(bytes = "bytes", tag = "1")]
    pub secret_share: Bytes,
    #[prost(bytes = "bytes", repeated, tag = "2")]
    pub proofs: Vec<Bytes>,
}

/// A refund transaction the user wants the federation to co-sign.
///
/// `operator_commitments` and `user_signature` are populated when the
/// user pre-signed against previously reserved operator commitments; left
/// empty, the coordinator reserves fresh commitments and returns operator
/// material for client-side aggregation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserRefundTxSigningJob {
    /// Unsigned raw refund transaction.
    #[prost(bytes = "bytes", tag = "1")]
    pub raw_tx: Bytes,
    /// The owner signing public key co-signing this refund.
    #[prost(bytes = "bytes", tag = "2")]
    pub signing_pubkey: Bytes,
    /// The user's nonce commitment for this signing session.
    #[prost(message, optional, tag = "3")]
    pub user_nonce_commitment: Option<SigningCommitmentProto>,
    /// Operator commitments the user pre-signed against, keyed by
    /// operator id. Empty unless `user_signature` is set.
    #[prost(map = "string, message", tag = "4")]
    pub operator_commitments: HashMap<String, SigningCommitmentProto>,
    /// The user's partial signature share, if pre-signed.
    #[prost(bytes = "bytes", tag = "5")]
    pub user_signature: Bytes,
}

/// Per-leaf payload of a transfer initiation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransferLeafJob {
    #[prost(string, tag = "1")]
    pub leaf_id: String,
    #[prost(message, optional, tag = "2")]
    pub cpfp_refund_tx_signing_job: Option<UserRefundTxSigningJob>,
    #[prost(message, optional, tag = "3")]
    pub direct_refund_tx_signing_job: Option<UserRefundTxSigningJob>,
    #[prost(message, optional, tag = "4")]
    pub direct_from_cpfp_refund_tx_signing_job: Option<UserRefundTxSigningJob>,
    /// Ciphertext of the new leaf secret, encrypted to the receiver.
    /// Opaque to operators.
    #[prost(bytes = "bytes", tag = "5")]
    pub secret_cipher: Bytes,
    /// Sender's ECDSA signature over `leaf_id || transfer_id || secret_cipher`.
    #[prost(bytes = "bytes", tag = "6")]
    pub signature: Bytes,
}

// ---------------------------------------------------------------------------
// Tree node / transfer mirrors
// ---------------------------------------------------------------------------

/// A tree node as returned to clients.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TreeNodeProto {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub tree_id: String,
    #[prost(uint64, tag = "3")]
    pub value: u64,
    #[prost(bytes = "bytes", tag = "4")]
    pub owner_identity_pubkey: Bytes,
    #[prost(bytes = "bytes", tag = "5")]
    pub owner_signing_pubkey: Bytes,
    #[prost(bytes = "bytes", tag = "6")]
    pub verifying_pubkey: Bytes,
    #[prost(bytes = "bytes", tag = "7")]
    pub node_tx: Bytes,
    #[prost(bytes = "bytes", tag = "8")]
    pub refund_tx: Bytes,
    #[prost(bytes = "bytes", tag = "9")]
    pub direct_tx: Bytes,
    #[prost(bytes = "bytes", tag = "10")]
    pub direct_refund_tx: Bytes,
    #[prost(bytes = "bytes", tag = "11")]
    pub direct_from_cpfp_refund_tx: Bytes,
    #[prost(string, optional, tag = "12")]
    pub parent_id: Option<String>,
    #[prost(uint32, tag = "13")]
    pub vout: u32,
    #[prost(int32, tag = "14")]
    pub network: i32,
    #[prost(string, tag = "15")]
    pub status: String,
}

/// A transfer leaf as returned to clients.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransferLeafProto {
    #[prost(message, optional, tag = "1")]
    pub leaf: Option<TreeNodeProto>,
    #[prost(bytes = "bytes", tag = "2")]
    pub secret_cipher: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub signature: Bytes,
    #[prost(bytes = "bytes", tag = "4")]
    pub pending_cpfp_refund_tx: Bytes,
    #[prost(bytes = "bytes", tag = "5")]
    pub pending_direct_refund_tx: Bytes,
    #[prost(bytes = "bytes", tag = "6")]
    pub pending_direct_from_cpfp_refund_tx: Bytes,
}

/// A transfer as returned to clients.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransferProto {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(int32, tag = "2")]
    pub transfer_type: i32,
    #[prost(int32, tag = "3")]
    pub status: i32,
    #[prost(bytes = "bytes", tag = "4")]
    pub sender_identity_pubkey: Bytes,
    #[prost(bytes = "bytes", tag = "5")]
    pub receiver_identity_pubkey: Bytes,
    #[prost(message, optional, tag = "6")]
    pub expiry_time: Option<::prost_types::Timestamp>,
    #[prost(int32, tag = "7")]
    pub network: i32,
    #[prost(message, repeated, tag = "8")]
    pub leaves: Vec<TransferLeafProto>,
}

// ---------------------------------------------------------------------------
// Signing results
// ---------------------------------------------------------------------------

/// Operator-side output of one signing session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SigningResultProto {
    /// Operator nonce commitments, keyed by operator id.
    #[prost(map = "string, message", tag = "1")]
    pub signing_commitments: HashMap<String, SigningCommitmentProto>,
    /// Operator partial signatures, keyed by operator id.
    #[prost(map = "string, bytes", tag = "2")]
    pub signature_shares: HashMap<String, Bytes>,
    /// Operator verifying shares, keyed by operator id.
    #[prost(map = "string, bytes", tag = "3")]
    pub public_shares: HashMap<String, Bytes>,
    /// Aggregated 64-byte signature, when the coordinator aggregated
    /// server-side (user partial was supplied).
    #[prost(bytes = "bytes", tag = "4")]
    pub final_signature: Bytes,
}

/// Signing results for one leaf across its refund variants.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeafSigningResult {
    #[prost(string, tag = "1")]
    pub leaf_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub verifying_pubkey: Bytes,
    #[prost(message, optional, tag = "3")]
    pub cpfp: Option<SigningResultProto>,
    #[prost(message, optional, tag = "4")]
    pub direct: Option<SigningResultProto>,
    #[prost(message, optional, tag = "5")]
    pub direct_from_cpfp: Option<SigningResultProto>,
}

/// Container for persisting or returning a batch of leaf signing results.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeafSigningResults {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<LeafSigningResult>,
}

// ---------------------------------------------------------------------------
// Signing commitments (pre-reservation for user-side pre-signing)
// ---------------------------------------------------------------------------

/// Reserve `count` operator nonce commitments per node.
///
/// The response is laid out variant-major: for `node_ids = [A, B]` and
/// `count = 3`, entries are `[A0, B0, A1, B1, A2, B2]`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSigningCommitmentsRequest {
    #[prost(string, repeated, tag = "1")]
    pub node_ids: Vec<String>,
    #[prost(uint32, tag = "2")]
    pub count: u32,
}

/// One reserved commitment set, keyed by operator id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestedCommitments {
    #[prost(map = "string, message", tag = "1")]
    pub signing_nonce_commitments: HashMap<String, SigningCommitmentProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSigningCommitmentsResponse {
    #[prost(message, repeated, tag = "1")]
    pub signing_commitments: Vec<RequestedCommitments>,
}

// ---------------------------------------------------------------------------
// Transfer initiation
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiateTransferRequest {
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
    pub leaves: Vec<TransferLeafJob>,
    /// Payment hash for preimage-gated transfers.
    #[prost(bytes = "bytes", tag = "8")]
    pub payment_hash: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiateTransferResponse {
    #[prost(message, optional, tag = "1")]
    pub transfer: Option<TransferProto>,
    #[prost(message, repeated, tag = "2")]
    pub signing_results: Vec<LeafSigningResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CooperativeExitRequest {
    #[prost(message, optional, tag = "1")]
    pub transfer: Option<InitiateTransferRequest>,
    #[prost(string, tag = "2")]
    pub exit_id: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub exit_txid: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CooperativeExitResponse {
    #[prost(message, optional, tag = "1")]
    pub transfer: Option<TransferProto>,
    #[prost(message, repeated, tag = "2")]
    pub signing_results: Vec<LeafSigningResult>,
}

// ---------------------------------------------------------------------------
// Key tweaks
// ---------------------------------------------------------------------------

/// An additive key tweak for one leaf, covering every operator.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeafTweakProto {
    #[prost(string, tag = "1")]
    pub leaf_id: String,
    /// Per-operator VSS share of the tweak scalar, keyed by operator id.
    #[prost(map = "string, message", tag = "2")]
    pub secret_shares: HashMap<String, SecretShareProto>,
    /// Per-operator public image of the share, keyed by operator id.
    #[prost(map = "string, bytes", tag = "3")]
    pub pubkey_shares_tweak: HashMap<String, Bytes>,
    /// The owner signing public key after the tweak.
    #[prost(bytes = "bytes", tag = "4")]
    pub new_owner_signing_pubkey: Bytes,
    /// The leaf's verifying public key, which the tweak must preserve.
    #[prost(bytes = "bytes", tag = "5")]
    pub verifying_pubkey: Bytes,
    #[prost(bytes = "bytes", tag = "6")]
    pub secret_cipher: Bytes,
    #[prost(bytes = "bytes", tag = "7")]
    pub signature: Bytes,
}

/// Final aggregated refund signatures for one leaf.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RefundSignature {
    #[prost(string, tag = "1")]
    pub leaf_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub cpfp_signature: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub direct_signature: Bytes,
    #[prost(bytes = "bytes", tag = "4")]
    pub direct_from_cpfp_signature: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendTransferTweakKeyRequest {
    #[prost(string, tag = "1")]
    pub transfer_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub sender_identity_pubkey: Bytes,
    #[prost(message, repeated, tag = "3")]
    pub leaf_tweaks: Vec<LeafTweakProto>,
    #[prost(message, repeated, tag = "4")]
    pub refund_signatures: Vec<RefundSignature>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendTransferTweakKeyResponse {
    #[prost(message, optional, tag = "1")]
    pub transfer: Option<TransferProto>,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryPendingTransfersRequest {
    #[prost(bytes = "bytes", tag = "1")]
    pub receiver_identity_pubkey: Bytes,
    #[prost(int32, tag = "2")]
    pub network: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryPendingTransfersResponse {
    #[prost(message, repeated, tag = "1")]
    pub transfers: Vec<TransferProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryAllTransfersRequest {
    #[prost(bytes = "bytes", tag = "1")]
    pub identity_pubkey: Bytes,
    #[prost(uint32, tag = "2")]
    pub limit: u32,
    #[prost(uint64, tag = "3")]
    pub offset: u64,
    /// Optional type filter; empty matches every type.
    #[prost(int32, repeated, tag = "4")]
    pub types: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryAllTransfersResponse {
    #[prost(message, repeated, tag = "1")]
    pub transfers: Vec<TransferProto>,
    #[prost(uint64, tag = "2")]
    pub next_offset: u64,
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClaimTransferTweakKeysRequest {
    #[prost(string, tag = "1")]
    pub transfer_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub receiver_identity_pubkey: Bytes,
    #[prost(message, repeated, tag = "3")]
    pub leaf_tweaks: Vec<LeafTweakProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClaimTransferTweakKeysResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClaimTransferSignRefundsRequest {
    #[prost(string, tag = "1")]
    pub transfer_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub receiver_identity_pubkey: Bytes,
    #[prost(message, repeated, tag = "3")]
    pub signing_jobs: Vec<TransferLeafJob>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClaimTransferSignRefundsResponse {
    #[prost(message, repeated, tag = "1")]
    pub signing_results: Vec<LeafSigningResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClaimTransferFinalizeRequest {
    #[prost(string, tag = "1")]
    pub transfer_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub receiver_identity_pubkey: Bytes,
    #[prost(message, repeated, tag = "3")]
    pub signatures: Vec<RefundSignature>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClaimTransferFinalizeResponse {}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelTransferRequest {
    #[prost(string, tag = "1")]
    pub transfer_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub sender_identity_pubkey: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelTransferResponse {
    #[prost(message, optional, tag = "1")]
    pub transfer: Option<TransferProto>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn transfer_proto_encode_decode_roundtrip() {
        let proto = TransferProto {
            id: "t1".into(),
            transfer_type: 2,
            status: 3,
            sender_identity_pubkey: Bytes::from_static(&[0x02; 33]),
            receiver_identity_pubkey: Bytes::from_static(&[0x03; 33]),
            expiry_time: Some(::prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
            network: 2,
            leaves: vec![TransferLeafProto {
                leaf: Some(TreeNodeProto {
                    id: "leaf-1".into(),
                    value: 100_000,
                    ..Default::default()
                }),
                secret_cipher: Bytes::from_static(b"cipher"),
                ..Default::default()
            }],
        };

        let encoded = proto.encode_to_vec();
        let decoded = TransferProto::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded, proto);
    }

    #[test]
    fn leaf_tweak_maps_roundtrip() {
        let mut secret_shares = HashMap::new();
        secret_shares.insert(
            "0".to_owned(),
            SecretShareProto {
                secret_share: Bytes::from_static(&[0x11; 32]),
                proofs: vec![Bytes::from_static(&[0x02; 33])],
            },
        );
        let mut pubkey_shares = HashMap::new();
        pubkey_shares.insert("0".to_owned(), Bytes::from_static(&[0x02; 33]));

        let tweak = LeafTweakProto {
            leaf_id: "leaf-1".into(),
            secret_shares,
            pubkey_shares_tweak: pubkey_shares,
            new_owner_signing_pubkey: Bytes::from_static(&[0x03; 33]),
            verifying_pubkey: Bytes::from_static(&[0x02; 33]),
            secret_cipher: Bytes::new(),
            signature: Bytes::new(),
        };

        let decoded = LeafTweakProto::decode(tweak.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, tweak);
        assert!(decoded.secret_shares.contains_key("0"));
    }
}

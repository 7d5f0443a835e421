//! Receiver-side flow: verify, tweak, co-sign, finalize.
//!
//! Mirrors the operator's three claim RPCs. The receiver recovers the
//! ephemeral leaf secret, checks the sender's binding signature and the
//! advertised keys, rotates the shares to a deterministic per-leaf claim
//! key, co-signs the new refund generation, aggregates the federation's
//! partials client-side, and hands the verified signatures back for
//! settlement.

use std::collections::{BTreeMap, HashMap};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Sequence;
use bytes::Bytes;

use config::FederationConfig;
use operator::bitcoin_tx::{
    compressed_to_xonly, create_cpfp_refund_tx, create_direct_refund_tx, parse_tx, refund_sighash,
    sequence_of, serialize_tx,
};
use operator::{Coordinator, OperatorError};
use spark_crypto::frost;
use transport::rpc::FollowerClient;
use transport::spark;

use crate::send::build_tweak_proto;
use crate::SimWallet;

// ---------------------------------------------------------------------------
// Verify pending
// ---------------------------------------------------------------------------

/// Verify a pending transfer and recover the per-leaf secrets.
///
/// Checks the sender's ECDSA binding signature over
/// `leaf_id || transfer_id || secret_cipher` and that the recovered
/// secret's public image matches the advertised owner signing key.
/// Returns the claimable key per leaf.
pub fn verify_pending(
    transfer: &spark::TransferProto,
) -> Result<HashMap<String, SecretKey>, OperatorError> {
    let secp = Secp256k1::verification_only();
    let sender_pk = PublicKey::from_slice(&transfer.sender_identity_pubkey)
        .map_err(|_| OperatorError::InvalidArgument("bad sender identity key"))?;

    let mut keys = HashMap::new();
    for leaf_state in &transfer.leaves {
        let leaf = leaf_state
            .leaf
            .as_ref()
            .ok_or(OperatorError::InvalidArgument("transfer leaf missing detail"))?;

        if !leaf_state.signature.is_empty() {
            let mut payload = Vec::new();
            payload.extend_from_slice(leaf.id.as_bytes());
            payload.extend_from_slice(transfer.id.as_bytes());
            payload.extend_from_slice(&leaf_state.secret_cipher);
            let digest = sha256::Hash::hash(&payload).to_byte_array();
            let sig = bitcoin::secp256k1::ecdsa::Signature::from_compact(&leaf_state.signature)
                .map_err(|_| OperatorError::InvalidArgument("bad sender binding signature"))?;
            secp.verify_ecdsa(
                &bitcoin::secp256k1::Message::from_digest(digest),
                &sig,
                &sender_pk,
            )
            .map_err(|_| OperatorError::InvalidArgument("sender binding signature invalid"))?;
        }

        let secret = SecretKey::from_slice(&leaf_state.secret_cipher)
            .map_err(|_| OperatorError::InvalidArgument("recovered leaf secret invalid"))?;
        let expected = PublicKey::from_secret_key(&Secp256k1::new(), &secret).serialize();
        if expected.as_slice() != leaf.owner_signing_pubkey.as_ref() {
            return Err(OperatorError::InvalidArgument(
                "recovered secret does not match the advertised owner key",
            ));
        }
        keys.insert(leaf.id.clone(), secret);
    }
    Ok(keys)
}

// ---------------------------------------------------------------------------
// Prepare
// ---------------------------------------------------------------------------

/// Claim state carried across the three RPC steps.
pub struct PreparedClaim {
    pub transfer_id: String,
    pub tweak_request: spark::ClaimTransferTweakKeysRequest,
    /// Per-leaf claim keys, recorded on the wallet at finalize.
    pub claim_keys: HashMap<String, SecretKey>,
}

/// Verify the transfer and build the receiver's key-tweak request,
/// rotating every leaf to the wallet's deterministic claim key.
pub fn prepare_claim(
    receiver: &SimWallet,
    transfer: &spark::TransferProto,
    config: &FederationConfig,
) -> Result<PreparedClaim, OperatorError> {
    let leaf_secrets = verify_pending(transfer)?;
    let mut rng = rand::thread_rng();

    let mut leaf_tweaks = Vec::with_capacity(transfer.leaves.len());
    let mut claim_keys = HashMap::new();
    for leaf_state in &transfer.leaves {
        let leaf = leaf_state
            .leaf
            .as_ref()
            .ok_or(OperatorError::InvalidArgument("transfer leaf missing detail"))?;
        let ephemeral = leaf_secrets
            .get(&leaf.id)
            .ok_or(OperatorError::InvalidArgument("missing leaf secret"))?;
        let claim_key = receiver.claim_key(&leaf.id);
        let verifying: [u8; 33] = leaf
            .verifying_pubkey
            .as_ref()
            .try_into()
            .map_err(|_| OperatorError::InvalidArgument("bad verifying key"))?;

        leaf_tweaks.push(build_tweak_proto(
            config,
            &leaf.id,
            ephemeral,
            &claim_key,
            &verifying,
            Vec::new(),
            Vec::new(),
            &mut rng,
        ));
        claim_keys.insert(leaf.id.clone(), claim_key);
    }

    Ok(PreparedClaim {
        transfer_id: transfer.id.clone(),
        tweak_request: spark::ClaimTransferTweakKeysRequest {
            transfer_id: transfer.id.clone(),
            receiver_identity_pubkey: Bytes::copy_from_slice(&receiver.identity()),
            leaf_tweaks,
        },
        claim_keys,
    })
}

// ---------------------------------------------------------------------------
// Sign + aggregate
// ---------------------------------------------------------------------------

/// Per-variant signing session the receiver keeps for aggregation.
struct ClaimSession {
    leaf_id: String,
    variant: Variant,
    message: [u8; 32],
    verifying: PublicKey,
    nonce_pair: frost::NoncePair,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Variant {
    Cpfp,
    DirectFromCpfp,
}

/// Build the claim signing jobs: new refunds paying the claim key,
/// preserving each pending refund's sequence exactly.
fn build_sign_request(
    receiver: &SimWallet,
    transfer: &spark::TransferProto,
    config: &FederationConfig,
    claim_keys: &HashMap<String, SecretKey>,
) -> Result<(spark::ClaimTransferSignRefundsRequest, Vec<ClaimSession>), OperatorError> {
    let secp = Secp256k1::new();
    let mut rng = rand::thread_rng();
    let mut jobs = Vec::with_capacity(transfer.leaves.len());
    let mut sessions = Vec::new();

    for leaf_state in &transfer.leaves {
        let leaf = leaf_state
            .leaf
            .as_ref()
            .ok_or(OperatorError::InvalidArgument("transfer leaf missing detail"))?;
        let claim_key = claim_keys
            .get(&leaf.id)
            .ok_or(OperatorError::InvalidArgument("missing claim key"))?;
        let claim_pk = PublicKey::from_secret_key(&secp, claim_key);
        let claim_xonly =
            compressed_to_xonly(&claim_pk.serialize()).expect("valid compressed key");
        let verifying = PublicKey::from_slice(&leaf.verifying_pubkey)
            .map_err(|_| OperatorError::InvalidArgument("bad verifying key"))?;

        let node_tx = parse_tx(&leaf.node_tx)
            .map_err(|_| OperatorError::InvalidArgument("bad node tx"))?;
        let node_txid = node_tx.compute_txid();
        let value = node_tx
            .output
            .get(leaf.vout as usize)
            .ok_or(OperatorError::InvalidArgument("bad leaf vout"))?
            .value;

        let share = frost::signing_share_from_bytes(&claim_key.secret_bytes())
            .map_err(|_| OperatorError::Internal("claim key is not a valid share"))?;

        let mut make_job = |variant: Variant,
                            current_raw: &[u8]|
         -> Result<spark::UserRefundTxSigningJob, OperatorError> {
            let sequence = Sequence::from_consensus(sequence_of(current_raw)?);
            let refund = match variant {
                Variant::Cpfp => create_cpfp_refund_tx(
                    node_txid,
                    leaf.vout,
                    value,
                    sequence,
                    &claim_xonly,
                    config.network,
                ),
                Variant::DirectFromCpfp => create_direct_refund_tx(
                    node_txid,
                    leaf.vout,
                    value,
                    sequence,
                    &claim_xonly,
                    config.network,
                ),
            };
            let raw = serialize_tx(&refund);
            let message = refund_sighash(&leaf.node_tx, leaf.vout, &raw)?;

            let pair = frost::generate_nonce_pair(&share, &mut rng);
            let (hiding, binding) =
                frost::commitment_components(&pair.commitment).expect("commitment serializes");
            sessions.push(ClaimSession {
                leaf_id: leaf.id.clone(),
                variant,
                message,
                verifying,
                nonce_pair: pair.clone(),
            });
            Ok(spark::UserRefundTxSigningJob {
                raw_tx: Bytes::from(raw),
                signing_pubkey: Bytes::copy_from_slice(&claim_pk.serialize()),
                user_nonce_commitment: Some(spark::SigningCommitmentProto {
                    hiding: Bytes::from(hiding),
                    binding: Bytes::from(binding),
                }),
                operator_commitments: Default::default(),
                user_signature: Bytes::new(),
            })
        };

        let cpfp_job = make_job(Variant::Cpfp, &leaf.refund_tx)?;
        let dfc_job = if leaf.direct_from_cpfp_refund_tx.is_empty() {
            None
        } else {
            Some(make_job(Variant::DirectFromCpfp, &leaf.direct_from_cpfp_refund_tx)?)
        };

        jobs.push(spark::TransferLeafJob {
            leaf_id: leaf.id.clone(),
            cpfp_refund_tx_signing_job: Some(cpfp_job),
            direct_refund_tx_signing_job: None,
            direct_from_cpfp_refund_tx_signing_job: dfc_job,
            secret_cipher: Bytes::new(),
            signature: Bytes::new(),
        });
    }

    Ok((
        spark::ClaimTransferSignRefundsRequest {
            transfer_id: transfer.id.clone(),
            receiver_identity_pubkey: Bytes::copy_from_slice(&receiver.identity()),
            signing_jobs: jobs,
        },
        sessions,
    ))
}

/// Aggregate operator partials with the receiver's own into final
/// signatures, per leaf.
fn aggregate_signatures(
    receiver: &SimWallet,
    sessions: &[ClaimSession],
    response: &spark::ClaimTransferSignRefundsResponse,
    config: &FederationConfig,
    claim_keys: &HashMap<String, SecretKey>,
    transfer_id: &str,
) -> Result<spark::ClaimTransferFinalizeRequest, OperatorError> {
    let secp = Secp256k1::new();
    let mut by_leaf: BTreeMap<String, spark::RefundSignature> = BTreeMap::new();

    for session in sessions {
        let leaf_result = response
            .signing_results
            .iter()
            .find(|r| r.leaf_id == session.leaf_id)
            .ok_or(OperatorError::Internal("missing signing result for leaf"))?;
        let result = match session.variant {
            Variant::Cpfp => leaf_result.cpfp.as_ref(),
            Variant::DirectFromCpfp => leaf_result.direct_from_cpfp.as_ref(),
        }
        .ok_or(OperatorError::Internal("missing signing result for variant"))?;

        let claim_key = claim_keys
            .get(&session.leaf_id)
            .ok_or(OperatorError::Internal("missing claim key"))?;
        let claim_pk = PublicKey::from_secret_key(&secp, claim_key);

        // Rebuild the participant set.
        let mut commitments = BTreeMap::new();
        let mut shares = BTreeMap::new();
        let mut verifying_shares = BTreeMap::new();
        for (op_id, proto) in &result.signing_commitments {
            let op = config
                .operator_by_id(op_id)
                .ok_or(OperatorError::Internal("unknown operator in result"))?;
            let identifier = frost::operator_identifier(op.index)
                .map_err(|_| OperatorError::Internal("bad operator index"))?;
            commitments.insert(
                identifier,
                frost::commitment_from_components(&proto.hiding, &proto.binding)
                    .map_err(|_| OperatorError::Internal("bad operator commitment"))?,
            );
            let share_bytes = result
                .signature_shares
                .get(op_id)
                .ok_or(OperatorError::Internal("missing operator partial"))?;
            shares.insert(
                identifier,
                frost::signature_share_from_bytes(share_bytes)
                    .map_err(|_| OperatorError::Internal("bad operator partial"))?,
            );
            let pk_bytes = result
                .public_shares
                .get(op_id)
                .ok_or(OperatorError::Internal("missing operator public share"))?;
            verifying_shares.insert(
                identifier,
                PublicKey::from_slice(pk_bytes)
                    .map_err(|_| OperatorError::Internal("bad operator public share"))?,
            );
        }

        let user = frost::user_identifier();
        commitments.insert(user, session.nonce_pair.commitment.clone());
        let partial = frost::sign_as_user(
            &session.message,
            claim_key,
            &claim_pk,
            &session.verifying,
            &session.nonce_pair.nonces,
            &commitments,
        )
        .map_err(|_| OperatorError::Internal("user partial signature failed"))?;
        shares.insert(user, partial);
        verifying_shares.insert(user, claim_pk);

        let signature = frost::aggregate(
            &session.message,
            commitments,
            &shares,
            &verifying_shares,
            &session.verifying,
        )
        .map_err(|_| OperatorError::Internal("client-side aggregation failed"))?;
        let bytes = frost::signature_to_bytes(&signature)
            .map_err(|_| OperatorError::Internal("signature serialization failed"))?;

        let entry = by_leaf
            .entry(session.leaf_id.clone())
            .or_insert_with(|| spark::RefundSignature {
                leaf_id: session.leaf_id.clone(),
                cpfp_signature: Bytes::new(),
                direct_signature: Bytes::new(),
                direct_from_cpfp_signature: Bytes::new(),
            });
        match session.variant {
            Variant::Cpfp => entry.cpfp_signature = Bytes::from(bytes),
            Variant::DirectFromCpfp => entry.direct_from_cpfp_signature = Bytes::from(bytes),
        }
    }

    Ok(spark::ClaimTransferFinalizeRequest {
        transfer_id: transfer_id.to_owned(),
        receiver_identity_pubkey: Bytes::copy_from_slice(&receiver.identity()),
        signatures: by_leaf.into_values().collect(),
    })
}

// ---------------------------------------------------------------------------
// Composite claim
// ---------------------------------------------------------------------------

/// Drive the full claim: tweak keys, sign refunds, aggregate, finalize.
///
/// Safe to call repeatedly; each step resumes from the persisted
/// transfer status, and a lost race surfaces as `Conflict`.
pub async fn claim_transfer<C: FollowerClient + 'static>(
    coordinator: &Coordinator<C>,
    receiver: &SimWallet,
    transfer: &spark::TransferProto,
) -> Result<(), OperatorError> {
    let config = coordinator.node().config().clone();
    let prepared = prepare_claim(receiver, transfer, &config)?;

    coordinator
        .claim_transfer_tweak_keys(prepared.tweak_request.clone())
        .await?;

    let (sign_request, sessions) =
        build_sign_request(receiver, transfer, &config, &prepared.claim_keys)?;
    let response = coordinator.claim_transfer_sign_refunds(sign_request).await?;

    let finalize = aggregate_signatures(
        receiver,
        &sessions,
        &response,
        &config,
        &prepared.claim_keys,
        &prepared.transfer_id,
    )?;
    coordinator.claim_transfer_finalize(finalize).await?;

    for (leaf_id, key) in prepared.claim_keys {
        receiver.adopt_leaf_key(&leaf_id, key);
    }
    Ok(())
}

//! Sender-side flow: pre-signed transfer initiation and key-tweak
//! material.
//!
//! The sender reserves operator nonce commitments, builds the next
//! refund generation paying an ephemeral key, pre-signs every refund
//! variant against the reserved commitments, and packages the additive
//! key tweak (`Δ = current − ephemeral`, VSS-split per operator) that
//! will move the leaf to the receiver once the federation has co-signed.

use std::collections::BTreeMap;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Sequence;
use bytes::Bytes;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;

use config::FederationConfig;
use operator::bitcoin_tx::{
    compressed_to_xonly, create_cpfp_refund_tx, create_direct_refund_tx, next_refund_sequence,
    parse_tx, refund_sighash, sequence_of, serialize_tx,
};
use operator::{Coordinator, OperatorError};
use spark_crypto::{frost, secp, vss};
use transport::rpc::FollowerClient;
use transport::spark;

use crate::{public_of, SimWallet};

/// Everything the sender needs across the two-step send.
pub struct PreparedSend {
    /// The transfer id the sender assigned.
    pub transfer_id: String,
    /// Ready-to-submit initiation request (pre-signed jobs included).
    pub request: spark::InitiateTransferRequest,
    /// Key-tweak material for the follow-up call.
    pub tweaks: Vec<spark::LeafTweakProto>,
    /// Ephemeral key per leaf; the receiver's claimable secret.
    pub ephemeral_keys: std::collections::HashMap<String, SecretKey>,
}

/// Build the per-operator tweak package for rotating a leaf's owner key.
pub(crate) fn build_tweak_proto(
    config: &FederationConfig,
    leaf_id: &str,
    old_owner_sk: &SecretKey,
    new_owner_sk: &SecretKey,
    verifying_pubkey: &[u8; 33],
    secret_cipher: Vec<u8>,
    signature: Vec<u8>,
    rng: &mut impl RngCore,
) -> spark::LeafTweakProto {
    let delta = secp::subtract_secret_keys(old_owner_sk, new_owner_sk)
        .expect("distinct keys yield a valid delta");
    let delta_scalar =
        vss::scalar_from_bytes(&delta.secret_bytes()).expect("secret key is a valid scalar");
    let shares = vss::split_with_proofs(
        &delta_scalar,
        config.min_signers,
        config.num_operators(),
        rng,
    )
    .expect("valid split parameters");

    let mut secret_shares = std::collections::HashMap::new();
    let mut pubkey_shares_tweak = std::collections::HashMap::new();
    for (op, share) in config.operators().iter().zip(&shares) {
        let proofs: Vec<Bytes> = share
            .proofs
            .iter()
            .map(|p| Bytes::copy_from_slice(p.to_encoded_point(true).as_bytes()))
            .collect();
        let share_bytes = vss::scalar_to_bytes(&share.value);
        secret_shares.insert(
            op.id.clone(),
            spark::SecretShareProto {
                secret_share: Bytes::copy_from_slice(&share_bytes),
                proofs,
            },
        );
        let share_sk = SecretKey::from_slice(&share_bytes).expect("share is a valid scalar");
        pubkey_shares_tweak.insert(
            op.id.clone(),
            Bytes::copy_from_slice(&secp::public_key_of(&share_sk).serialize()),
        );
    }

    spark::LeafTweakProto {
        leaf_id: leaf_id.to_owned(),
        secret_shares,
        pubkey_shares_tweak,
        new_owner_signing_pubkey: Bytes::copy_from_slice(&public_of(new_owner_sk)),
        verifying_pubkey: Bytes::copy_from_slice(verifying_pubkey),
        secret_cipher: Bytes::from(secret_cipher),
        signature: Bytes::from(signature),
    }
}

/// Prepare a pre-signed transfer of `leaf_ids` to `receiver_identity`.
///
/// Reserves operator commitments through the coordinator, decrements
/// each refund's timelock by one interval, pre-signs as the current
/// owner, and assembles the tweak package. Nothing is submitted yet.
pub async fn prepare_send<C: FollowerClient + 'static>(
    coordinator: &Coordinator<C>,
    sender: &SimWallet,
    receiver_identity: [u8; 33],
    leaf_ids: &[&str],
    expiry_time: u64,
) -> Result<PreparedSend, OperatorError> {
    let secp = Secp256k1::new();
    let mut rng = rand::thread_rng();
    let config = coordinator.node().config().clone();
    let leaves = &coordinator.node().stores().leaves;

    let transfer_id = {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        format!(
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            u16::from_be_bytes([bytes[4], bytes[5]]),
            u16::from_be_bytes([bytes[6], bytes[7]]),
            u16::from_be_bytes([bytes[8], bytes[9]]),
            u64::from_be_bytes([0, 0, bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]]),
        )
    };

    // Reserve operator commitments: two per leaf (CPFP, direct-from-CPFP),
    // variant-major layout.
    let commitments = coordinator
        .get_signing_commitments(spark::GetSigningCommitmentsRequest {
            node_ids: leaf_ids.iter().map(|s| (*s).to_owned()).collect(),
            count: 2,
        })
        .await?;
    let n_leaves = leaf_ids.len();

    let mut jobs = Vec::with_capacity(n_leaves);
    let mut tweaks = Vec::with_capacity(n_leaves);
    let mut ephemeral_keys = std::collections::HashMap::new();

    for (leaf_idx, leaf_id) in leaf_ids.iter().enumerate() {
        let leaf = leaves
            .get(leaf_id)
            .map_err(|_| OperatorError::NotFound("unknown leaf"))?;
        let owner_sk = sender
            .leaf_key(leaf_id)
            .ok_or(OperatorError::PermissionDenied("wallet does not control this leaf"))?;
        let owner_pk = PublicKey::from_secret_key(&secp, &owner_sk);

        // Ephemeral rotation target.
        let ephemeral_sk = SecretKey::new(&mut rng);
        let ephemeral_pk = PublicKey::from_secret_key(&secp, &ephemeral_sk);
        let ephemeral_xonly =
            compressed_to_xonly(&ephemeral_pk.serialize()).expect("valid compressed key");

        // Next-generation refunds paying the ephemeral key.
        let node_tx = parse_tx(&leaf.node_tx).expect("stored node tx parses");
        let node_txid = node_tx.compute_txid();
        let value = node_tx.output[leaf.vout as usize].value;

        let current_cpfp = leaf.refund_tx.as_ref().expect("leaf has a refund tx");
        let cpfp_seq = next_refund_sequence(sequence_of(current_cpfp)?)?;
        let cpfp_refund = create_cpfp_refund_tx(
            node_txid,
            leaf.vout,
            value,
            Sequence::from_consensus(cpfp_seq),
            &ephemeral_xonly,
            config.network,
        );

        let current_dfc = leaf
            .direct_from_cpfp_refund_tx
            .as_ref()
            .expect("leaf has a direct-from-cpfp refund tx");
        let dfc_seq = next_refund_sequence(sequence_of(current_dfc)?)?;
        let dfc_refund = create_direct_refund_tx(
            node_txid,
            leaf.vout,
            value,
            Sequence::from_consensus(dfc_seq),
            &ephemeral_xonly,
            config.network,
        );

        // Pre-sign each variant against the reserved commitment sets.
        let verifying =
            PublicKey::from_slice(&leaf.verifying_pubkey).expect("stored verifying key parses");
        let mut presign = |entry_idx: usize, raw_tx: &[u8], prev_tx: &[u8], prev_vout: u32| {
            let entry = &commitments.signing_commitments[entry_idx];
            let message = refund_sighash(prev_tx, prev_vout, raw_tx).expect("sighash computes");

            let mut all_commitments = BTreeMap::new();
            for (op_id, proto) in &entry.signing_nonce_commitments {
                let op = config.operator_by_id(op_id).expect("operator in config");
                all_commitments.insert(
                    frost::operator_identifier(op.index).expect("valid index"),
                    frost::commitment_from_components(&proto.hiding, &proto.binding)
                        .expect("operator commitment parses"),
                );
            }
            let share = frost::signing_share_from_bytes(&owner_sk.secret_bytes())
                .expect("owner key is a valid share");
            let pair = frost::generate_nonce_pair(&share, &mut rng);
            all_commitments.insert(frost::user_identifier(), pair.commitment.clone());

            let partial = frost::sign_as_user(
                &message,
                &owner_sk,
                &owner_pk,
                &verifying,
                &pair.nonces,
                &all_commitments,
            )
            .expect("user partial signature");

            let (hiding, binding) =
                frost::commitment_components(&pair.commitment).expect("commitment serializes");
            spark::UserRefundTxSigningJob {
                raw_tx: Bytes::copy_from_slice(raw_tx),
                signing_pubkey: Bytes::copy_from_slice(&owner_pk.serialize()),
                user_nonce_commitment: Some(spark::SigningCommitmentProto {
                    hiding: Bytes::from(hiding),
                    binding: Bytes::from(binding),
                }),
                operator_commitments: entry.signing_nonce_commitments.clone(),
                user_signature: Bytes::from(frost::signature_share_to_bytes(&partial)),
            }
        };

        let cpfp_raw = serialize_tx(&cpfp_refund);
        let dfc_raw = serialize_tx(&dfc_refund);
        let cpfp_job = presign(leaf_idx, &cpfp_raw, &leaf.node_tx, leaf.vout);
        let dfc_job = presign(n_leaves + leaf_idx, &dfc_raw, &leaf.node_tx, leaf.vout);

        // The "ciphertext" of the ephemeral secret (see crate docs) and
        // the sender's binding signature over it.
        let secret_cipher = ephemeral_sk.secret_bytes().to_vec();
        let mut payload = Vec::new();
        payload.extend_from_slice(leaf_id.as_bytes());
        payload.extend_from_slice(transfer_id.as_bytes());
        payload.extend_from_slice(&secret_cipher);
        let signature = sender.sign_ecdsa(&payload);

        jobs.push(spark::TransferLeafJob {
            leaf_id: (*leaf_id).to_owned(),
            cpfp_refund_tx_signing_job: Some(cpfp_job),
            direct_refund_tx_signing_job: None,
            direct_from_cpfp_refund_tx_signing_job: Some(dfc_job),
            secret_cipher: Bytes::from(secret_cipher.clone()),
            signature: Bytes::from(signature.clone()),
        });
        tweaks.push(build_tweak_proto(
            &config,
            leaf_id,
            &owner_sk,
            &ephemeral_sk,
            &leaf.verifying_pubkey,
            secret_cipher,
            signature,
            &mut rng,
        ));
        ephemeral_keys.insert((*leaf_id).to_owned(), ephemeral_sk);
    }

    let request = spark::InitiateTransferRequest {
        transfer_id: transfer_id.clone(),
        transfer_type: storage::transfer::TransferType::Transfer.to_proto(),
        expiry_time: Some(::prost_types::Timestamp {
            seconds: expiry_time as i64,
            nanos: 0,
        }),
        sender_identity_pubkey: Bytes::copy_from_slice(&sender.identity()),
        receiver_identity_pubkey: Bytes::copy_from_slice(&receiver_identity),
        network: config.network.to_proto(),
        leaves: jobs,
        payment_hash: Bytes::new(),
    };

    Ok(PreparedSend {
        transfer_id,
        request,
        tweaks,
        ephemeral_keys,
    })
}

/// The follow-up key-tweak call for a prepared send.
pub fn tweak_request(sender: &SimWallet, prepared: &PreparedSend) -> spark::SendTransferTweakKeyRequest {
    spark::SendTransferTweakKeyRequest {
        transfer_id: prepared.transfer_id.clone(),
        sender_identity_pubkey: Bytes::copy_from_slice(&sender.identity()),
        leaf_tweaks: prepared.tweaks.clone(),
        refund_signatures: Vec::new(),
    }
}

//! Test-tree construction: deal a leaf, its refund transactions, and a
//! VSS-split operator key share onto every node of a federation.

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::RngCore;

use config::constants::{INITIAL_TIMELOCK, SPARK_SEQUENCE_FLAG};
use operator::bitcoin_tx::{
    bitcoin_network, compressed_to_xonly, create_cpfp_refund_tx, create_direct_refund_tx,
    serialize_tx,
};
use operator::OperatorNode;
use spark_crypto::{secp, vss};
use storage::keyshare::{KeyshareStatus, SigningKeyshare};
use storage::leaf::{TreeNode, TreeNodeStatus};

use crate::SimWallet;

fn uuid(rng: &mut impl RngCore) -> String {
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
}

/// Deal a fresh leaf worth `value` sats to `owner` across the whole
/// federation: every node receives the same leaf row and its own slice
/// of the operator group secret. Returns the leaf id; the owner's
/// signing key is recorded on the wallet.
pub fn create_leaf(nodes: &[OperatorNode], owner: &SimWallet, value: u64) -> String {
    assert!(!nodes.is_empty(), "federation must have at least one node");
    let config = nodes[0].config().clone();
    let secp = Secp256k1::new();
    let mut rng = rand::thread_rng();

    let leaf_id = uuid(&mut rng);
    let tree_id = uuid(&mut rng);

    // Owner signing key and operator group secret.
    let owner_sk = SecretKey::new(&mut rng);
    let owner_pk = PublicKey::from_secret_key(&secp, &owner_sk);
    let group_sk = SecretKey::new(&mut rng);
    let group_pk = PublicKey::from_secret_key(&secp, &group_sk);
    let verifying = secp::add_public_keys(&owner_pk, &group_pk).expect("distinct keys");

    // Split the group secret into one share per operator.
    let group_scalar =
        vss::scalar_from_bytes(&group_sk.secret_bytes()).expect("secret key is a valid scalar");
    let shares = vss::split_with_proofs(
        &group_scalar,
        config.min_signers,
        config.num_operators(),
        &mut rng,
    )
    .expect("valid split parameters");

    // Public image of every operator's share, known to all.
    let mut public_shares = std::collections::BTreeMap::new();
    for (op, share) in config.operators().iter().zip(&shares) {
        let share_sk = SecretKey::from_slice(&vss::scalar_to_bytes(&share.value))
            .expect("share is a valid scalar");
        public_shares.insert(op.id.clone(), secp::public_key_of(&share_sk).serialize());
    }

    // A funding transaction paying the Taproot output of the verifying
    // key. The outpoint is synthetic; the operators never look behind it.
    let verifying_xonly =
        compressed_to_xonly(&verifying.serialize()).expect("valid compressed key");
    let funding_secp = Secp256k1::verification_only();
    let address = bitcoin::Address::p2tr(
        &funding_secp,
        verifying_xonly,
        None,
        bitcoin_network(config.network),
    );
    let node_tx = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: address.script_pubkey(),
        }],
    };
    let node_txid = node_tx.compute_txid();

    // Generation-zero refunds pay back to the owner at the full timelock.
    let initial_sequence =
        Sequence::from_consensus(SPARK_SEQUENCE_FLAG | u32::from(INITIAL_TIMELOCK));
    let owner_xonly = compressed_to_xonly(&owner_pk.serialize()).expect("valid compressed key");
    let cpfp_refund = create_cpfp_refund_tx(
        node_txid,
        0,
        Amount::from_sat(value),
        initial_sequence,
        &owner_xonly,
        config.network,
    );
    let dfc_refund = create_direct_refund_tx(
        node_txid,
        0,
        Amount::from_sat(value),
        initial_sequence,
        &owner_xonly,
        config.network,
    );

    let keyshare_id = format!("ks-{leaf_id}");
    for (node, share) in nodes.iter().zip(&shares) {
        node.stores()
            .keyshares
            .insert(SigningKeyshare {
                id: keyshare_id.clone(),
                status: KeyshareStatus::InUse,
                secret_share: vss::scalar_to_bytes(&share.value),
                public_shares: public_shares.clone(),
                public_key: group_pk.serialize(),
                min_signers: config.min_signers,
                coordinator_index: 0,
            })
            .expect("fresh keyshare id");

        node.stores()
            .leaves
            .insert(TreeNode {
                id: leaf_id.clone(),
                tree_id: tree_id.clone(),
                value,
                owner_identity_pubkey: owner.identity(),
                owner_signing_pubkey: owner_pk.serialize(),
                verifying_pubkey: verifying.serialize(),
                keyshare_id: keyshare_id.clone(),
                node_tx: serialize_tx(&node_tx),
                refund_tx: Some(serialize_tx(&cpfp_refund)),
                direct_tx: None,
                direct_refund_tx: None,
                direct_from_cpfp_refund_tx: Some(serialize_tx(&dfc_refund)),
                parent_id: None,
                vout: 0,
                network: config.network,
                status: TreeNodeStatus::Available,
            })
            .expect("fresh leaf id");
    }

    owner.adopt_leaf_key(&leaf_id, owner_sk);

    // Consistency check the deal before handing it to tests: the shares
    // must recover the group secret.
    debug_assert_eq!(
        vss::recover_secret(&shares[..config.min_signers]).expect("recoverable"),
        group_scalar
    );

    leaf_id
}

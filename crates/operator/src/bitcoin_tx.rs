//! Refund-transaction construction, Taproot sighashes, and timelock
//! sequence math.
//!
//! The relative timelock in a refund's `nSequence` is the off-chain clock:
//! every transfer generation must carry a sequence whose timelock field is
//! exactly one [`TIMELOCK_INTERVAL`](config::constants::TIMELOCK_INTERVAL)
//! below its predecessor's, and a claim re-sign must preserve it. Both
//! rules are enforced here, against the raw transactions, before any
//! signing happens.

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey, schnorr};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use config::constants::{DEFAULT_FEE_SATS, SPARK_SEQUENCE_FLAG, TIMELOCK_INTERVAL, TIMELOCK_MASK};
use config::Network;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors from transaction utilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// Failed to deserialize a raw transaction.
    DeserializeFailed,
    /// Failed to compute a sighash.
    SighashFailed,
    /// The transaction is missing required data (inputs or outputs).
    MissingData,
    /// The remaining timelock is too small for another generation.
    TimelockExhausted,
    /// A successor refund's sequence is not the expected decrement.
    SequenceNotDecremented,
    /// A claim refund changed the sequence it had to preserve.
    SequenceNotPreserved,
    /// A signature failed BIP-340 verification.
    BadSignature,
    /// A public key could not be parsed.
    BadKey,
}

impl core::fmt::Display for TxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DeserializeFailed => write!(f, "transaction deserialization failed"),
            Self::SighashFailed => write!(f, "sighash computation failed"),
            Self::MissingData => write!(f, "transaction missing required data"),
            Self::TimelockExhausted => write!(f, "refund timelock exhausted"),
            Self::SequenceNotDecremented => write!(f, "refund sequence not decremented"),
            Self::SequenceNotPreserved => write!(f, "refund sequence not preserved"),
            Self::BadSignature => write!(f, "signature verification failed"),
            Self::BadKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for TxError {}

impl From<TxError> for crate::OperatorError {
    fn from(err: TxError) -> Self {
        match err {
            TxError::TimelockExhausted => {
                Self::FailedPrecondition("refund timelock exhausted; refresh the leaf first")
            }
            TxError::SequenceNotDecremented => {
                Self::FailedPrecondition("refund sequence not decremented")
            }
            TxError::SequenceNotPreserved => {
                Self::InvalidArgument("claim refund must preserve the sequence")
            }
            TxError::BadSignature => Self::InvalidArgument("refund signature invalid"),
            _ => Self::InvalidArgument("malformed transaction"),
        }
    }
}

// ---------------------------------------------------------------------------
// Parse / serialize
// ---------------------------------------------------------------------------

/// Deserialize a consensus-encoded Bitcoin transaction.
pub fn parse_tx(raw: &[u8]) -> Result<Transaction, TxError> {
    deserialize(raw).map_err(|_| TxError::DeserializeFailed)
}

/// Serialize a transaction to consensus bytes.
pub fn serialize_tx(tx: &Transaction) -> Vec<u8> {
    serialize(tx)
}

/// Map a protocol network to the bitcoin crate's network.
pub fn bitcoin_network(network: Network) -> bitcoin::Network {
    match network {
        Network::Mainnet => bitcoin::Network::Bitcoin,
        Network::Regtest => bitcoin::Network::Regtest,
    }
}

// ---------------------------------------------------------------------------
// Refund construction
// ---------------------------------------------------------------------------

/// Create a **CPFP** refund transaction: P2TR output plus a zero-value
/// BIP-431 ephemeral anchor (`OP_1 <0x4e73>`) for child-pays-for-parent
/// fee bumping.
pub fn create_cpfp_refund_tx(
    prev_txid: Txid,
    prev_vout: u32,
    value: Amount,
    sequence: Sequence,
    owner_xonly: &XOnlyPublicKey,
    network: Network,
) -> Transaction {
    let secp = Secp256k1::verification_only();
    let address = Address::p2tr(&secp, *owner_xonly, None, bitcoin_network(network));
    let anchor_script = ScriptBuf::from_bytes(vec![0x51, 0x02, 0x4e, 0x73]);

    Transaction {
        version: bitcoin::transaction::Version::non_standard(3),
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(prev_txid, prev_vout),
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        }],
        output: vec![
            TxOut {
                value,
                script_pubkey: address.script_pubkey(),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: anchor_script,
            },
        ],
    }
}

/// Create a **direct** refund transaction: single P2TR output with the
/// relay fee pre-subtracted (no anchor to bump).
pub fn create_direct_refund_tx(
    prev_txid: Txid,
    prev_vout: u32,
    value: Amount,
    sequence: Sequence,
    owner_xonly: &XOnlyPublicKey,
    network: Network,
) -> Transaction {
    let secp = Secp256k1::verification_only();
    let address = Address::p2tr(&secp, *owner_xonly, None, bitcoin_network(network));

    let raw = value.to_sat();
    let output_sats = if raw > DEFAULT_FEE_SATS {
        raw - DEFAULT_FEE_SATS
    } else {
        raw
    };

    Transaction {
        version: bitcoin::transaction::Version::non_standard(3),
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(prev_txid, prev_vout),
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(output_sats),
            script_pubkey: address.script_pubkey(),
        }],
    }
}

// ---------------------------------------------------------------------------
// Sighash
// ---------------------------------------------------------------------------

/// BIP-341 key-spend sighash (`SIGHASH_DEFAULT`) for one input.
pub fn taproot_sighash(
    tx: &Transaction,
    input_idx: usize,
    prev_outs: &[TxOut],
) -> Result<[u8; 32], TxError> {
    let mut cache = SighashCache::new(tx);
    let hash = cache
        .taproot_key_spend_signature_hash(input_idx, &Prevouts::All(prev_outs), TapSighashType::Default)
        .map_err(|_| TxError::SighashFailed)?;
    Ok(hash.to_byte_array())
}

/// Sighash of a refund spending `vout` of the given node transaction.
pub fn refund_sighash(node_tx_raw: &[u8], vout: u32, refund_raw: &[u8]) -> Result<[u8; 32], TxError> {
    let node_tx = parse_tx(node_tx_raw)?;
    let prev_out = node_tx
        .output
        .get(vout as usize)
        .ok_or(TxError::MissingData)?
        .clone();
    let refund = parse_tx(refund_raw)?;
    taproot_sighash(&refund, 0, std::slice::from_ref(&prev_out))
}

// ---------------------------------------------------------------------------
// Sequence math
// ---------------------------------------------------------------------------

/// The block timelock encoded in a sequence number.
pub fn timelock_of(sequence: u32) -> u16 {
    (sequence & TIMELOCK_MASK) as u16
}

/// First-input sequence of a raw transaction.
pub fn sequence_of(raw: &[u8]) -> Result<u32, TxError> {
    let tx = parse_tx(raw)?;
    tx.input
        .first()
        .map(|i| i.sequence.to_consensus_u32())
        .ok_or(TxError::MissingData)
}

/// Sequence for the next refund generation: same flag bits, timelock
/// reduced by one interval.
///
/// # Errors
///
/// Returns [`TxError::TimelockExhausted`] when the remaining timelock is
/// at or below the interval; the leaf must be refreshed through
/// split/consolidation before transferring again.
pub fn next_refund_sequence(old: u32) -> Result<u32, TxError> {
    let timelock = timelock_of(old);
    if timelock <= TIMELOCK_INTERVAL {
        return Err(TxError::TimelockExhausted);
    }
    let flags = old & !TIMELOCK_MASK;
    Ok(flags | SPARK_SEQUENCE_FLAG | u32::from(timelock - TIMELOCK_INTERVAL))
}

/// Check that `new_raw`'s sequence is exactly one interval below
/// `old_raw`'s. Property: every successor refund has a strictly smaller
/// timelock.
pub fn verify_sequence_decremented(old_raw: &[u8], new_raw: &[u8]) -> Result<(), TxError> {
    let old = sequence_of(old_raw)?;
    let new = sequence_of(new_raw)?;
    let expected = next_refund_sequence(old)?;
    if new != expected {
        return Err(TxError::SequenceNotDecremented);
    }
    Ok(())
}

/// Check that a claim re-sign preserved the pending refund's sequence
/// exactly (flags included).
pub fn verify_sequence_preserved(pending_raw: &[u8], new_raw: &[u8]) -> Result<(), TxError> {
    if sequence_of(pending_raw)? != sequence_of(new_raw)? {
        return Err(TxError::SequenceNotPreserved);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Verify a 64-byte BIP-340 signature over `sighash` under the leaf's
/// verifying key, Taproot-tweaked to the output key it spends.
pub fn verify_refund_signature(
    verifying_pubkey: &[u8; 33],
    sighash: &[u8; 32],
    signature: &[u8],
) -> Result<(), TxError> {
    let secp = Secp256k1::verification_only();
    let verifying =
        bitcoin::secp256k1::PublicKey::from_slice(verifying_pubkey).map_err(|_| TxError::BadKey)?;
    let (xonly, _) = verifying.x_only_public_key();
    let (output_key, _) = xonly.tap_tweak(&secp, None);
    let output_xonly =
        XOnlyPublicKey::from_slice(&output_key.serialize()).map_err(|_| TxError::BadKey)?;

    let sig = schnorr::Signature::from_slice(signature).map_err(|_| TxError::BadSignature)?;
    secp.verify_schnorr(&sig, &Message::from_digest(*sighash), &output_xonly)
        .map_err(|_| TxError::BadSignature)
}

/// Convert a compressed key to x-only by dropping the parity byte.
pub fn compressed_to_xonly(compressed: &[u8; 33]) -> Option<XOnlyPublicKey> {
    XOnlyPublicKey::from_slice(&compressed[1..]).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use config::constants::INITIAL_TIMELOCK;

    const GEN_COMPRESSED: [u8; 33] = [
        0x02, 0x79, 0xBE, 0x66, 0x7E, 0xF9, 0xDC, 0xBB, 0xAC, 0x55, 0xA0, 0x62, 0x95, 0xCE, 0x87,
        0x0B, 0x07, 0x02, 0x9B, 0xFC, 0xDB, 0x2D, 0xCE, 0x28, 0xD9, 0x59, 0xF2, 0x81, 0x5B, 0x16,
        0xF8, 0x17, 0x98,
    ];

    fn spark_sequence(timelock: u16) -> u32 {
        SPARK_SEQUENCE_FLAG | u32::from(timelock)
    }

    #[test]
    fn cpfp_refund_has_anchor_output() {
        let xonly = compressed_to_xonly(&GEN_COMPRESSED).unwrap();
        let tx = create_cpfp_refund_tx(
            Txid::from_byte_array([0xAA; 32]),
            0,
            Amount::from_sat(100_000),
            Sequence::from_consensus(spark_sequence(INITIAL_TIMELOCK)),
            &xonly,
            Network::Regtest,
        );
        assert_eq!(tx.output.len(), 2);
        assert!(tx.output[0].script_pubkey.is_p2tr());
        assert_eq!(tx.output[0].value, Amount::from_sat(100_000));
        assert_eq!(tx.output[1].value, Amount::ZERO);
        assert_eq!(tx.output[1].script_pubkey.as_bytes(), &[0x51, 0x02, 0x4e, 0x73]);

        let raw = serialize_tx(&tx);
        assert_eq!(parse_tx(&raw).unwrap().compute_txid(), tx.compute_txid());
    }

    #[test]
    fn direct_refund_subtracts_fee_once() {
        let xonly = compressed_to_xonly(&GEN_COMPRESSED).unwrap();
        let tx = create_direct_refund_tx(
            Txid::from_byte_array([0xBB; 32]),
            0,
            Amount::from_sat(100_000),
            Sequence::from_consensus(spark_sequence(INITIAL_TIMELOCK)),
            &xonly,
            Network::Regtest,
        );
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, Amount::from_sat(100_000 - DEFAULT_FEE_SATS));

        // Dust-sized values keep their full amount rather than underflowing.
        let dust = create_direct_refund_tx(
            Txid::from_byte_array([0xBB; 32]),
            0,
            Amount::from_sat(500),
            Sequence::from_consensus(spark_sequence(INITIAL_TIMELOCK)),
            &xonly,
            Network::Regtest,
        );
        assert_eq!(dust.output[0].value, Amount::from_sat(500));
    }

    #[test]
    fn next_sequence_decrements_one_interval() {
        let old = spark_sequence(INITIAL_TIMELOCK);
        let new = next_refund_sequence(old).unwrap();
        assert_eq!(timelock_of(new), INITIAL_TIMELOCK - TIMELOCK_INTERVAL);
        assert_eq!(new & SPARK_SEQUENCE_FLAG, SPARK_SEQUENCE_FLAG);
        assert!(timelock_of(new) < timelock_of(old));
    }

    #[test]
    fn exhausted_timelock_refuses_next_generation() {
        assert_eq!(
            next_refund_sequence(spark_sequence(TIMELOCK_INTERVAL)),
            Err(TxError::TimelockExhausted)
        );
        assert_eq!(
            next_refund_sequence(spark_sequence(TIMELOCK_INTERVAL - 1)),
            Err(TxError::TimelockExhausted)
        );
    }

    #[test]
    fn sequence_checks_on_raw_transactions() {
        let xonly = compressed_to_xonly(&GEN_COMPRESSED).unwrap();
        let txid = Txid::from_byte_array([0xCC; 32]);
        let old = create_cpfp_refund_tx(
            txid,
            0,
            Amount::from_sat(1000),
            Sequence::from_consensus(spark_sequence(2000)),
            &xonly,
            Network::Regtest,
        );
        let good = create_cpfp_refund_tx(
            txid,
            0,
            Amount::from_sat(1000),
            Sequence::from_consensus(spark_sequence(1900)),
            &xonly,
            Network::Regtest,
        );
        let bad = create_cpfp_refund_tx(
            txid,
            0,
            Amount::from_sat(1000),
            Sequence::from_consensus(spark_sequence(1950)),
            &xonly,
            Network::Regtest,
        );

        let old_raw = serialize_tx(&old);
        verify_sequence_decremented(&old_raw, &serialize_tx(&good)).unwrap();
        assert_eq!(
            verify_sequence_decremented(&old_raw, &serialize_tx(&bad)),
            Err(TxError::SequenceNotDecremented)
        );

        verify_sequence_preserved(&old_raw, &old_raw).unwrap();
        assert_eq!(
            verify_sequence_preserved(&old_raw, &serialize_tx(&good)),
            Err(TxError::SequenceNotPreserved)
        );
    }

    #[test]
    fn refund_sighash_is_stable() {
        let xonly = compressed_to_xonly(&GEN_COMPRESSED).unwrap();
        // A minimal "node tx" with one P2TR output.
        let node_tx = create_direct_refund_tx(
            Txid::from_byte_array([0x01; 32]),
            0,
            Amount::from_sat(50_000),
            Sequence::from_consensus(spark_sequence(2000)),
            &xonly,
            Network::Regtest,
        );
        let refund = create_cpfp_refund_tx(
            node_tx.compute_txid(),
            0,
            node_tx.output[0].value,
            Sequence::from_consensus(spark_sequence(1900)),
            &xonly,
            Network::Regtest,
        );

        let node_raw = serialize_tx(&node_tx);
        let refund_raw = serialize_tx(&refund);
        let a = refund_sighash(&node_raw, 0, &refund_raw).unwrap();
        let b = refund_sighash(&node_raw, 0, &refund_raw).unwrap();
        assert_eq!(a, b);

        assert_eq!(refund_sighash(&node_raw, 5, &refund_raw), Err(TxError::MissingData));
    }
}

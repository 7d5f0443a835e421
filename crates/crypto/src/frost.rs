//! FROST threshold signing, operator side.
//!
//! A refund transaction is signed by a nested FROST group: the signing
//! operators form one participant group, the leaf owner (the "user") forms
//! a second single-member group. Lagrange coefficients are computed within
//! each group, which is what makes Spark's additive key structure
//! (`verifying_key = owner_key + operator_group_key`) reconstruct
//! correctly.
//!
//! Round 1 produces a nonce pair per signing session; the commitment half
//! is published, the nonce half stays in the operator's nonce pool until
//! the sign round consumes it. Round 2 produces a partial signature bound
//! to the full commitment set. Aggregation combines operator partials with
//! the user's partial into one BIP-340 signature under the Taproot-tweaked
//! verifying key.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitcoin::secp256k1::{PublicKey, SecretKey};
use frost_secp256k1_tr::{
    Identifier, SigningPackage, VerifyingKey,
    keys::{EvenY, KeyPackage, PublicKeyPackage, SigningShare, Tweak, VerifyingShare},
    round1::{NonceCommitment, SigningCommitments, SigningNonces},
    round2::SignatureShare,
};
use rand_core::{CryptoRng, RngCore};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors returned by FROST operations.
#[derive(Debug)]
pub enum FrostError {
    /// Round 2 signing failed (invalid key, nonce, or commitment set).
    SigningFailed,

    /// Aggregation failed (invalid shares or commitment mismatch).
    AggregationFailed,

    /// An identifier could not be derived or converted.
    InvalidIdentifier,

    /// A signing commitment is invalid or could not be deserialized.
    InvalidCommitment,

    /// A signature share is invalid or could not be deserialized.
    InvalidSignatureShare,

    /// A signing nonce could not be (de)serialized.
    InvalidNonce,
}

impl fmt::Display for FrostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigningFailed => write!(f, "FROST signing failed"),
            Self::AggregationFailed => write!(f, "FROST signature aggregation failed"),
            Self::InvalidIdentifier => write!(f, "invalid FROST identifier"),
            Self::InvalidCommitment => write!(f, "invalid signing commitment"),
            Self::InvalidSignatureShare => write!(f, "invalid signature share"),
            Self::InvalidNonce => write!(f, "invalid signing nonce"),
        }
    }
}

impl std::error::Error for FrostError {}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// The fixed identifier of the user participant.
///
/// Derived from the literal string `"user"`, matching the Spark SDK
/// constant, so every operator and every wallet agree on it without
/// coordination.
pub fn user_identifier() -> Identifier {
    Identifier::derive(b"user").expect("user identifier derivation cannot fail")
}

/// The FROST identifier of the operator at the given zero-based federation
/// index. Identifier zero is invalid, so operators occupy `1..=n`.
///
/// # Errors
///
/// Returns [`FrostError::InvalidIdentifier`] on overflow.
pub fn operator_identifier(index: u16) -> Result<Identifier, FrostError> {
    index
        .checked_add(1)
        .ok_or(FrostError::InvalidIdentifier)
        .and_then(|i| Identifier::try_from(i).map_err(|_| FrostError::InvalidIdentifier))
}

// ---------------------------------------------------------------------------
// Round 1 -- nonce pairs
// ---------------------------------------------------------------------------

/// A signing nonce pair: the secret nonces and their public commitment.
#[derive(Debug, Clone)]
pub struct NoncePair {
    /// Secret nonces. Consumed by exactly one sign round.
    pub nonces: SigningNonces,
    /// Public commitment, published to the coordinator.
    pub commitment: SigningCommitments,
}

/// Generate a fresh nonce pair for one signing session.
///
/// Two fresh scalars per session, bound to the signing share. The caller
/// supplies the RNG so this crate carries no runtime `rand` dependency.
pub fn generate_nonce_pair(
    signing_share: &SigningShare,
    rng: &mut (impl RngCore + CryptoRng),
) -> NoncePair {
    let (nonces, commitment) = frost_secp256k1_tr::round1::commit(signing_share, rng);
    NoncePair { nonces, commitment }
}

// ---------------------------------------------------------------------------
// Round 2 -- partial signatures
// ---------------------------------------------------------------------------

/// Build the nested participant groups from a commitment set: all
/// non-user identifiers in one group, the user in a second.
fn nested_groups(commitments: &BTreeMap<Identifier, SigningCommitments>) -> Vec<BTreeSet<Identifier>> {
    let user = user_identifier();
    let operator_group: BTreeSet<Identifier> =
        commitments.keys().filter(|id| **id != user).cloned().collect();
    vec![operator_group, BTreeSet::from([user])]
}

/// Produce an operator's partial signature over `message`.
///
/// The operator's key package is Taproot-tweaked internally
/// (`sign_with_tweak`), consistent with [`aggregate`]. The commitment set
/// must contain every participant of the session, including the user and
/// this operator itself.
///
/// # Errors
///
/// Returns [`FrostError::SigningFailed`] if key conversion or signing fails.
pub fn sign_as_operator(
    message: &[u8],
    share_secret: &SecretKey,
    share_public: &PublicKey,
    verifying_key: &PublicKey,
    identifier: Identifier,
    nonces: &SigningNonces,
    commitments: &BTreeMap<Identifier, SigningCommitments>,
) -> Result<SignatureShare, FrostError> {
    let groups = nested_groups(commitments);
    let signing_package =
        SigningPackage::new_with_participants_groups(commitments.clone(), Some(groups), message);

    let signing_share = SigningShare::deserialize(&share_secret.secret_bytes())
        .map_err(|_| FrostError::SigningFailed)?;
    let verifying_share = VerifyingShare::deserialize(&share_public.serialize())
        .map_err(|_| FrostError::SigningFailed)?;
    let group_key = VerifyingKey::deserialize(&verifying_key.serialize())
        .map_err(|_| FrostError::SigningFailed)?;

    let key_package = KeyPackage::new(identifier, signing_share, verifying_share, group_key, 1);

    frost_secp256k1_tr::round2::sign_with_tweak(&signing_package, nonces, &key_package, Some(b""))
        .map_err(|_| FrostError::SigningFailed)
}

/// Produce the user's partial signature over `message`.
///
/// The user role differs from an operator in one way: the signing and
/// verifying shares are even-Y adjusted but do **not** receive the Taproot
/// tweak scalar -- only the group verifying key does. Aggregation adds the
/// tweak on the operator side, and the sum works out only when the user's
/// share is left untweaked. Used by the wallet simulator and tests; real
/// wallets do the same thing on their side of the wire.
///
/// # Errors
///
/// Returns [`FrostError::SigningFailed`] if key conversion or signing fails.
pub fn sign_as_user(
    message: &[u8],
    owner_secret: &SecretKey,
    owner_public: &PublicKey,
    verifying_key: &PublicKey,
    nonces: &SigningNonces,
    commitments: &BTreeMap<Identifier, SigningCommitments>,
) -> Result<SignatureShare, FrostError> {
    let groups = nested_groups(commitments);
    let signing_package =
        SigningPackage::new_with_participants_groups(commitments.clone(), Some(groups), message);

    let signing_share = SigningShare::deserialize(&owner_secret.secret_bytes())
        .map_err(|_| FrostError::SigningFailed)?;
    let verifying_share = VerifyingShare::deserialize(&owner_public.serialize())
        .map_err(|_| FrostError::SigningFailed)?;
    let group_key = VerifyingKey::deserialize(&verifying_key.serialize())
        .map_err(|_| FrostError::SigningFailed)?;

    let raw = KeyPackage::new(user_identifier(), signing_share, verifying_share, group_key, 1);

    // Even-Y adjust the shares, take the fully tweaked group key.
    let tweaked = raw.clone().tweak(Some(&[] as &[u8]));
    let even_y = raw.into_even_y(Some(group_key.has_even_y()));
    let key_package = KeyPackage::new(
        *even_y.identifier(),
        *even_y.signing_share(),
        *even_y.verifying_share(),
        *tweaked.verifying_key(),
        *tweaked.min_signers(),
    );

    frost_secp256k1_tr::round2::sign(&signing_package, nonces, &key_package)
        .map_err(|_| FrostError::SigningFailed)
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Aggregate partial signatures into one BIP-340 signature.
///
/// `commitments`, `signature_shares`, and `verifying_shares` must cover the
/// same participant set (operators plus user). The result verifies under
/// the Taproot-tweaked `verifying_key`.
///
/// # Errors
///
/// Returns [`FrostError::AggregationFailed`] if any share is inconsistent.
pub fn aggregate(
    message: &[u8],
    commitments: BTreeMap<Identifier, SigningCommitments>,
    signature_shares: &BTreeMap<Identifier, SignatureShare>,
    verifying_shares: &BTreeMap<Identifier, PublicKey>,
    verifying_key: &PublicKey,
) -> Result<frost_secp256k1_tr::Signature, FrostError> {
    let groups = nested_groups(&commitments);
    let signing_package =
        SigningPackage::new_with_participants_groups(commitments, Some(groups), message);

    let mut frost_shares = BTreeMap::new();
    for (id, pk) in verifying_shares {
        let share = VerifyingShare::deserialize(&pk.serialize())
            .map_err(|_| FrostError::AggregationFailed)?;
        frost_shares.insert(*id, share);
    }

    let group_key = VerifyingKey::deserialize(&verifying_key.serialize())
        .map_err(|_| FrostError::AggregationFailed)?;
    let public_key_package = PublicKeyPackage::new(frost_shares, group_key);

    frost_secp256k1_tr::aggregate_with_tweak(
        &signing_package,
        signature_shares,
        &public_key_package,
        Some(b""),
    )
    .map_err(|_| FrostError::AggregationFailed)
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Marshal a commitment to its 66-byte wire form: `hiding || binding`,
/// each a 33-byte compressed point. This is the nonce pool's lookup key.
///
/// # Errors
///
/// Returns [`FrostError::InvalidCommitment`] if serialization fails.
pub fn commitment_to_binary(commitment: &SigningCommitments) -> Result<[u8; 66], FrostError> {
    let hiding = commitment
        .hiding()
        .serialize()
        .map_err(|_| FrostError::InvalidCommitment)?;
    let binding = commitment
        .binding()
        .serialize()
        .map_err(|_| FrostError::InvalidCommitment)?;
    if hiding.len() != 33 || binding.len() != 33 {
        return Err(FrostError::InvalidCommitment);
    }
    let mut out = [0u8; 66];
    out[..33].copy_from_slice(&hiding);
    out[33..].copy_from_slice(&binding);
    Ok(out)
}

/// Rebuild a commitment from separate hiding and binding components
/// (each a 33-byte compressed SEC1 point), the inverse of
/// [`commitment_to_binary`] and the layout proto messages use.
///
/// # Errors
///
/// Returns [`FrostError::InvalidCommitment`] if either component is invalid.
pub fn commitment_from_components(
    hiding: &[u8],
    binding: &[u8],
) -> Result<SigningCommitments, FrostError> {
    let hiding =
        NonceCommitment::deserialize(hiding).map_err(|_| FrostError::InvalidCommitment)?;
    let binding =
        NonceCommitment::deserialize(binding).map_err(|_| FrostError::InvalidCommitment)?;
    Ok(SigningCommitments::new(hiding, binding))
}

/// Split a commitment into its (hiding, binding) wire components.
///
/// # Errors
///
/// Returns [`FrostError::InvalidCommitment`] if serialization fails.
pub fn commitment_components(
    commitment: &SigningCommitments,
) -> Result<(Vec<u8>, Vec<u8>), FrostError> {
    let hiding = commitment
        .hiding()
        .serialize()
        .map_err(|_| FrostError::InvalidCommitment)?;
    let binding = commitment
        .binding()
        .serialize()
        .map_err(|_| FrostError::InvalidCommitment)?;
    Ok((hiding, binding))
}

/// Serialize secret signing nonces for the nonce pool.
///
/// # Errors
///
/// Returns [`FrostError::InvalidNonce`] if serialization fails.
pub fn nonces_to_bytes(nonces: &SigningNonces) -> Result<Vec<u8>, FrostError> {
    nonces.serialize().map_err(|_| FrostError::InvalidNonce)
}

/// Deserialize secret signing nonces from the nonce pool.
///
/// # Errors
///
/// Returns [`FrostError::InvalidNonce`] if the bytes are invalid.
pub fn nonces_from_bytes(bytes: &[u8]) -> Result<SigningNonces, FrostError> {
    SigningNonces::deserialize(bytes).map_err(|_| FrostError::InvalidNonce)
}

/// Deserialize a signing share (32-byte secret scalar).
///
/// # Errors
///
/// Returns [`FrostError::InvalidSignatureShare`] if the bytes are invalid.
pub fn signing_share_from_bytes(bytes: &[u8]) -> Result<SigningShare, FrostError> {
    SigningShare::deserialize(bytes).map_err(|_| FrostError::InvalidSignatureShare)
}

/// Serialize a partial signature share.
pub fn signature_share_to_bytes(share: &SignatureShare) -> Vec<u8> {
    share.serialize()
}

/// Deserialize a partial signature share.
///
/// # Errors
///
/// Returns [`FrostError::InvalidSignatureShare`] if the bytes are invalid.
pub fn signature_share_from_bytes(bytes: &[u8]) -> Result<SignatureShare, FrostError> {
    SignatureShare::deserialize(bytes).map_err(|_| FrostError::InvalidSignatureShare)
}

/// Serialize an aggregated signature to its 64-byte BIP-340 form.
///
/// # Errors
///
/// Returns [`FrostError::AggregationFailed`] if serialization fails.
pub fn signature_to_bytes(sig: &frost_secp256k1_tr::Signature) -> Result<Vec<u8>, FrostError> {
    sig.serialize().map_err(|_| FrostError::AggregationFailed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;

    fn share_from(byte: u8) -> SigningShare {
        signing_share_from_bytes(&[byte; 32]).expect("valid test share")
    }

    #[test]
    fn user_identifier_is_deterministic() {
        assert_eq!(user_identifier(), user_identifier());
    }

    #[test]
    fn operator_identifiers_are_distinct_and_never_user() {
        let user = user_identifier();
        let mut seen = std::collections::BTreeSet::new();
        for index in 0..5u16 {
            let id = operator_identifier(index).unwrap();
            assert_ne!(id, user);
            assert!(seen.insert(id), "identifier collision at index {index}");
        }
    }

    #[test]
    fn commitment_binary_roundtrip() {
        let pair = generate_nonce_pair(&share_from(0x11), &mut rand_core::OsRng);

        let binary = commitment_to_binary(&pair.commitment).unwrap();
        let rebuilt = commitment_from_components(&binary[..33], &binary[33..]).unwrap();
        assert_eq!(commitment_to_binary(&rebuilt).unwrap(), binary);
    }

    #[test]
    fn nonce_serialization_roundtrip() {
        let pair = generate_nonce_pair(&share_from(0x22), &mut rand_core::OsRng);
        let bytes = nonces_to_bytes(&pair.nonces).unwrap();
        let recovered = nonces_from_bytes(&bytes).unwrap();
        assert_eq!(nonces_to_bytes(&recovered).unwrap(), bytes);
    }

    #[test]
    fn nested_groups_split_user_from_operators() {
        let mut commitments = BTreeMap::new();
        for index in 0..3u16 {
            let pair = generate_nonce_pair(&share_from(index as u8 + 1), &mut rand_core::OsRng);
            commitments.insert(operator_identifier(index).unwrap(), pair.commitment);
        }
        let user_pair = generate_nonce_pair(&share_from(9), &mut rand_core::OsRng);
        commitments.insert(user_identifier(), user_pair.commitment);

        let groups = nested_groups(&commitments);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 1);
        assert!(groups[1].contains(&user_identifier()));
    }

    /// Full two-group ceremony: one operator holding the whole group secret
    /// plus the user, additive verifying key. Checks that operator and user
    /// partials aggregate into a signature accepted by libsecp under the
    /// Taproot-tweaked output key.
    #[test]
    fn single_operator_and_user_ceremony_verifies() {
        let secp = Secp256k1::new();
        let mut rng = rand_core::OsRng;

        let operator_sk = SecretKey::from_slice(&[0x31; 32]).unwrap();
        let operator_pk = PublicKey::from_secret_key(&secp, &operator_sk);
        let user_sk = SecretKey::from_slice(&[0x55; 32]).unwrap();
        let user_pk = PublicKey::from_secret_key(&secp, &user_sk);
        let verifying = operator_pk.combine(&user_pk).unwrap();

        let message = [0xAB; 32];

        let op_id = operator_identifier(0).unwrap();
        let op_pair = generate_nonce_pair(
            &signing_share_from_bytes(&operator_sk.secret_bytes()).unwrap(),
            &mut rng,
        );
        let user_pair = generate_nonce_pair(
            &signing_share_from_bytes(&user_sk.secret_bytes()).unwrap(),
            &mut rng,
        );

        let mut commitments = BTreeMap::new();
        commitments.insert(op_id, op_pair.commitment);
        commitments.insert(user_identifier(), user_pair.commitment);

        let op_share = sign_as_operator(
            &message,
            &operator_sk,
            &operator_pk,
            &verifying,
            op_id,
            &op_pair.nonces,
            &commitments,
        )
        .unwrap();
        let user_share = sign_as_user(
            &message,
            &user_sk,
            &user_pk,
            &verifying,
            &user_pair.nonces,
            &commitments,
        )
        .unwrap();

        let mut shares = BTreeMap::new();
        shares.insert(op_id, op_share);
        shares.insert(user_identifier(), user_share);

        let mut verifying_shares = BTreeMap::new();
        verifying_shares.insert(op_id, operator_pk);
        verifying_shares.insert(user_identifier(), user_pk);

        let signature =
            aggregate(&message, commitments, &shares, &verifying_shares, &verifying).unwrap();
        let sig_bytes = signature_to_bytes(&signature).unwrap();
        assert_eq!(sig_bytes.len(), 64);

        // Verify as BIP-340 under the tweaked output key.
        use bitcoin::key::TapTweak;
        let (xonly, _) = verifying.x_only_public_key();
        let (output_key, _) = xonly.tap_tweak(&secp, None);
        let output_xonly =
            bitcoin::secp256k1::XOnlyPublicKey::from_slice(&output_key.serialize()).unwrap();
        let schnorr_sig = bitcoin::secp256k1::schnorr::Signature::from_slice(&sig_bytes).unwrap();
        let msg = bitcoin::secp256k1::Message::from_digest(message);
        secp.verify_schnorr(&schnorr_sig, &msg, &output_xonly)
            .expect("aggregated signature must verify under tweaked key");
    }
}

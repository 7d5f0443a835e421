//! Verifiable secret sharing over secp256k1.
//!
//! Key-share tweaks arrive at an operator as one share of a Shamir split,
//! accompanied by Feldman proofs: one curve point per polynomial
//! coefficient, committed by whoever performed the split. An operator
//! validates its share against the proofs before applying it
//! ([`validate_share`]); the free-coefficient proof (`proofs[0]`) is the
//! public image of the whole tweak and anchors the verifying-key shift
//! check.
//!
//! [`split_with_proofs`] and [`recover_secret`] implement the user role
//! and are exercised by the wallet simulator and tests.

use std::collections::BTreeSet;
use std::fmt;

use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, FieldBytes, ProjectivePoint, PublicKey, Scalar};
use rand_core::RngCore;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors returned by VSS operations.
#[derive(Debug, PartialEq, Eq)]
pub enum VssError {
    /// Threshold is zero or exceeds the number of shares.
    InvalidThreshold,
    /// Byte slice is not 32 bytes.
    InvalidByteLength { expected: usize, got: usize },
    /// Byte value exceeds the secp256k1 scalar field order.
    ScalarOutOfRange,
    /// Fewer shares provided than the threshold requires.
    InsufficientShares { required: usize, provided: usize },
    /// Two or more shares have the same index.
    DuplicateShareIndices,
    /// The denominator of a Lagrange coefficient was not invertible.
    NotInvertible,
    /// Proof vector length does not match the threshold.
    InvalidProofLength { expected: usize, got: usize },
    /// The share does not lie on the polynomial committed by the proofs.
    ShareValidationFailed,
}

impl fmt::Display for VssError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidThreshold => write!(f, "invalid threshold"),
            Self::InvalidByteLength { expected, got } => {
                write!(f, "invalid byte length: expected {expected}, got {got}")
            }
            Self::ScalarOutOfRange => write!(f, "scalar out of range"),
            Self::InsufficientShares { required, provided } => {
                write!(f, "insufficient shares: need {required}, got {provided}")
            }
            Self::DuplicateShareIndices => write!(f, "duplicate share indices"),
            Self::NotInvertible => write!(f, "element not invertible"),
            Self::InvalidProofLength { expected, got } => {
                write!(f, "invalid proof length: expected {expected}, got {got}")
            }
            Self::ShareValidationFailed => write!(f, "share validation failed"),
        }
    }
}

impl std::error::Error for VssError {}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One verifiable share of a split secret.
#[derive(Debug, Clone)]
pub struct VerifiableShare {
    /// Minimum number of shares needed for reconstruction.
    pub threshold: usize,
    /// Share index (x-coordinate); operator at federation index `i`
    /// receives the share at `x = i + 1`.
    pub index: Scalar,
    /// Share value (y-coordinate).
    pub value: Scalar,
    /// Feldman commitments, one point per polynomial coefficient.
    /// `proofs[0]` is the public image of the secret itself.
    pub proofs: Vec<PublicKey>,
}

// ---------------------------------------------------------------------------
// Scalar helpers
// ---------------------------------------------------------------------------

/// Parse a 32-byte big-endian slice as a secp256k1 scalar.
///
/// # Errors
///
/// Returns [`VssError::InvalidByteLength`] or [`VssError::ScalarOutOfRange`].
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, VssError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| VssError::InvalidByteLength {
        expected: 32,
        got: bytes.len(),
    })?;
    Scalar::from_repr_vartime(FieldBytes::from(arr)).ok_or(VssError::ScalarOutOfRange)
}

/// Serialize a scalar as 32 big-endian bytes.
pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

/// The curve point `s·G` for a non-zero scalar.
fn commit(s: &Scalar) -> PublicKey {
    let point = ProjectivePoint::GENERATOR * *s;
    PublicKey::from_affine(AffinePoint::from(point)).expect("non-zero scalar yields valid point")
}

// ---------------------------------------------------------------------------
// Splitting
// ---------------------------------------------------------------------------

/// Split `secret` into `shares` verifiable shares with the given threshold.
///
/// Shares are issued at indices `1..=shares`. Each carries the full proof
/// vector so any holder can validate independently.
///
/// # Errors
///
/// Returns [`VssError::InvalidThreshold`] if `threshold` is zero or exceeds
/// `shares`.
pub fn split_with_proofs(
    secret: &Scalar,
    threshold: usize,
    shares: usize,
    rng: &mut impl RngCore,
) -> Result<Vec<VerifiableShare>, VssError> {
    if threshold == 0 || threshold > shares {
        return Err(VssError::InvalidThreshold);
    }

    // Random polynomial with the secret as the constant term.
    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(*secret);
    for _ in 1..threshold {
        let mut buf = [0u8; 32];
        loop {
            rng.fill_bytes(&mut buf);
            if let Ok(c) = scalar_from_bytes(&buf) {
                coefficients.push(c);
                break;
            }
        }
    }
    let proofs: Vec<PublicKey> = coefficients.iter().map(commit).collect();

    let out = (1..=shares)
        .map(|i| {
            let index = Scalar::from(i as u64);
            // Horner evaluation, highest coefficient first.
            let mut value = Scalar::ZERO;
            for c in coefficients.iter().rev() {
                value = value * index + c;
            }
            VerifiableShare {
                threshold,
                index,
                value,
                proofs: proofs.clone(),
            }
        })
        .collect();

    Ok(out)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a share against its proof vector.
///
/// Checks `value·G == Σ_k proofs[k] · index^k`, i.e. that the share lies on
/// the polynomial committed by the proofs. Evaluated in Horner form over
/// curve points.
///
/// # Errors
///
/// Returns [`VssError::InvalidProofLength`] or
/// [`VssError::ShareValidationFailed`].
pub fn validate_share(share: &VerifiableShare) -> Result<(), VssError> {
    if share.proofs.len() != share.threshold {
        return Err(VssError::InvalidProofLength {
            expected: share.threshold,
            got: share.proofs.len(),
        });
    }

    let mut expected = ProjectivePoint::IDENTITY;
    for proof in share.proofs.iter().rev() {
        expected = expected * share.index + ProjectivePoint::from(proof.as_affine());
    }

    if AffinePoint::from(expected) == *commit(&share.value).as_affine() {
        Ok(())
    } else {
        Err(VssError::ShareValidationFailed)
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Recover the secret from at least `threshold` distinct shares.
///
/// # Errors
///
/// Returns [`VssError::InsufficientShares`],
/// [`VssError::DuplicateShareIndices`], or [`VssError::NotInvertible`].
pub fn recover_secret(shares: &[VerifiableShare]) -> Result<Scalar, VssError> {
    let required = shares.first().map(|s| s.threshold).unwrap_or(1);
    if shares.len() < required {
        return Err(VssError::InsufficientShares {
            required,
            provided: shares.len(),
        });
    }

    let mut seen: BTreeSet<[u8; 32]> = BTreeSet::new();
    for s in shares {
        if !seen.insert(scalar_to_bytes(&s.index)) {
            return Err(VssError::DuplicateShareIndices);
        }
    }

    // Lagrange interpolation at zero.
    let mut secret = Scalar::ZERO;
    for s in shares {
        let mut numerator = Scalar::ONE;
        let mut denominator = Scalar::ONE;
        for other in shares {
            if other.index == s.index {
                continue;
            }
            numerator *= -other.index;
            denominator *= s.index - other.index;
        }
        let inv = denominator
            .invert()
            .into_option()
            .ok_or(VssError::NotInvertible)?;
        secret += s.value * numerator * inv;
    }
    Ok(secret)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_from(byte: u8) -> Scalar {
        scalar_from_bytes(&[byte; 32]).unwrap()
    }

    #[test]
    fn scalar_bytes_roundtrip() {
        let bytes = [0x42; 32];
        let scalar = scalar_from_bytes(&bytes).unwrap();
        assert_eq!(scalar_to_bytes(&scalar), bytes);
    }

    #[test]
    fn scalar_rejects_wrong_length_and_overflow() {
        assert!(matches!(
            scalar_from_bytes(&[0u8; 31]),
            Err(VssError::InvalidByteLength { expected: 32, got: 31 })
        ));
        assert_eq!(scalar_from_bytes(&[0xFF; 32]), Err(VssError::ScalarOutOfRange));
    }

    #[test]
    fn split_validate_recover() {
        let secret = secret_from(0x5A);
        let shares = split_with_proofs(&secret, 3, 5, &mut rand::thread_rng()).unwrap();
        assert_eq!(shares.len(), 5);

        for share in &shares {
            validate_share(share).unwrap();
        }

        // Any threshold-sized subset recovers.
        assert_eq!(recover_secret(&shares[0..3]).unwrap(), secret);
        assert_eq!(recover_secret(&shares[2..5]).unwrap(), secret);
    }

    #[test]
    fn free_coefficient_proof_is_secret_image() {
        let secret = secret_from(0x33);
        let shares = split_with_proofs(&secret, 2, 4, &mut rand::thread_rng()).unwrap();
        assert_eq!(shares[0].proofs[0], commit(&secret));
    }

    #[test]
    fn split_rejects_bad_thresholds() {
        let secret = secret_from(0x01);
        assert_eq!(
            split_with_proofs(&secret, 0, 5, &mut rand::thread_rng()).unwrap_err(),
            VssError::InvalidThreshold
        );
        assert_eq!(
            split_with_proofs(&secret, 6, 5, &mut rand::thread_rng()).unwrap_err(),
            VssError::InvalidThreshold
        );
    }

    #[test]
    fn recover_rejects_insufficient_and_duplicates() {
        let secret = secret_from(0x11);
        let shares = split_with_proofs(&secret, 3, 5, &mut rand::thread_rng()).unwrap();

        assert!(matches!(
            recover_secret(&shares[0..2]),
            Err(VssError::InsufficientShares { required: 3, provided: 2 })
        ));

        let duped = vec![shares[0].clone(), shares[0].clone(), shares[0].clone()];
        assert_eq!(recover_secret(&duped).unwrap_err(), VssError::DuplicateShareIndices);
    }

    #[test]
    fn tampered_share_fails_validation() {
        let secret = secret_from(0x77);
        let mut shares = split_with_proofs(&secret, 3, 5, &mut rand::thread_rng()).unwrap();

        shares[1].value = shares[2].value;
        assert_eq!(validate_share(&shares[1]).unwrap_err(), VssError::ShareValidationFailed);
    }

    #[test]
    fn truncated_proof_vector_fails_validation() {
        let secret = secret_from(0x77);
        let mut shares = split_with_proofs(&secret, 3, 5, &mut rand::thread_rng()).unwrap();

        shares[0].proofs.pop();
        assert!(matches!(
            validate_share(&shares[0]),
            Err(VssError::InvalidProofLength { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn share_values_transport_as_bytes() {
        // Shares cross the wire as 32-byte scalars; rebuilding from bytes
        // must preserve validity and recovery.
        let secret = secret_from(0x29);
        let shares = split_with_proofs(&secret, 2, 3, &mut rand::thread_rng()).unwrap();

        let rebuilt: Vec<VerifiableShare> = shares
            .iter()
            .map(|s| VerifiableShare {
                threshold: s.threshold,
                index: s.index,
                value: scalar_from_bytes(&scalar_to_bytes(&s.value)).unwrap(),
                proofs: s.proofs.clone(),
            })
            .collect();

        for share in &rebuilt {
            validate_share(share).unwrap();
        }
        assert_eq!(recover_secret(&rebuilt[0..2]).unwrap(), secret);
    }
}

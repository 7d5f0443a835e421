//! Additive secp256k1 key arithmetic.
//!
//! Key-share tweaks are additive scalars: applying a tweak `δ` moves an
//! operator's share from `s` to `s + δ` and its public image from `S` to
//! `S + δ·G`. These helpers wrap the `bitcoin::secp256k1` operations the
//! tweak paths need.

use bitcoin::secp256k1::{Error as Secp256k1Error, PublicKey, Scalar, Secp256k1, SecretKey};

/// Add two secret keys (`a + b` mod curve order).
///
/// # Errors
///
/// Returns [`Secp256k1Error`] if the sum is zero or out of range.
pub fn add_secret_keys(a: &SecretKey, b: &SecretKey) -> Result<SecretKey, Secp256k1Error> {
    a.add_tweak(&Scalar::from(*b))
}

/// Subtract secret key `b` from `a` (`a - b` mod curve order).
///
/// # Errors
///
/// Returns [`Secp256k1Error`] if the difference is zero or out of range.
pub fn subtract_secret_keys(a: &SecretKey, b: &SecretKey) -> Result<SecretKey, Secp256k1Error> {
    let negated = b.negate();
    a.add_tweak(&Scalar::from(negated))
}

/// Add two public keys (`A + B`).
///
/// # Errors
///
/// Returns [`Secp256k1Error`] if the sum is the point at infinity.
pub fn add_public_keys(a: &PublicKey, b: &PublicKey) -> Result<PublicKey, Secp256k1Error> {
    a.combine(b)
}

/// Subtract public key `B` from `A` (`A - B`).
///
/// # Errors
///
/// Returns [`Secp256k1Error`] if the difference is the point at infinity.
pub fn subtract_public_keys(a: &PublicKey, b: &PublicKey) -> Result<PublicKey, Secp256k1Error> {
    let secp = Secp256k1::new();
    let negated = b.negate(&secp);
    a.combine(&negated)
}

/// The public image `s·G` of a secret key.
pub fn public_key_of(s: &SecretKey) -> PublicKey {
    let secp = Secp256k1::new();
    PublicKey::from_secret_key(&secp, s)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sk(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn addition_commutes_with_public_image() {
        let a = sk(0x01);
        let b = sk(0x02);

        let sum = add_secret_keys(&a, &b).unwrap();
        let expected = add_public_keys(&public_key_of(&a), &public_key_of(&b)).unwrap();
        assert_eq!(public_key_of(&sum), expected);
    }

    #[test]
    fn subtract_undoes_add() {
        let a = sk(0x0A);
        let b = sk(0x0B);

        let sum = add_secret_keys(&a, &b).unwrap();
        let back = subtract_secret_keys(&sum, &b).unwrap();
        assert_eq!(back, a);

        let pub_sum = add_public_keys(&public_key_of(&a), &public_key_of(&b)).unwrap();
        let pub_back = subtract_public_keys(&pub_sum, &public_key_of(&b)).unwrap();
        assert_eq!(pub_back, public_key_of(&a));
    }

    #[test]
    fn tweak_shifts_public_image_deterministically() {
        // new_share = old_share + delta  =>  new_pub = old_pub + delta*G
        let old_share = sk(0x21);
        let delta = sk(0x07);

        let new_share = add_secret_keys(&old_share, &delta).unwrap();
        let shifted =
            add_public_keys(&public_key_of(&old_share), &public_key_of(&delta)).unwrap();
        assert_eq!(public_key_of(&new_share), shifted);
    }
}

//! User-role simulator for the Spark operator federation.
//!
//! Plays the wallet side of the protocol against an in-process
//! [`operator::cluster::LocalCluster`]: dealing test trees and key
//! shares, preparing pre-signed transfers with key-tweak material,
//! and driving the three-step claim. Production wallets do the same
//! things on the far side of the wire; this crate exists so operator
//! tests and the simnet can exercise complete multi-operator scenarios
//! without one.
//!
//! One deliberate simplification: the `secret_cipher` handed to
//! operators is the raw ephemeral secret rather than an ECIES
//! ciphertext. Operators treat the field as opaque bytes either way,
//! and wallet-side encryption is outside the operator core.

pub mod claim;
pub mod send;
pub mod tree;

pub use claim::{claim_transfer, prepare_claim, verify_pending, PreparedClaim};
pub use send::{prepare_send, tweak_request, PreparedSend};
pub use tree::create_leaf;

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

/// A simulated wallet identity with its per-leaf signing keys.
pub struct SimWallet {
    identity_sk: SecretKey,
    identity: [u8; 33],
    leaf_keys: Mutex<HashMap<String, SecretKey>>,
}

impl SimWallet {
    /// Deterministic wallet from a seed byte (distinct seeds give
    /// distinct identities).
    pub fn new(seed: u8) -> Self {
        let digest = sha256::Hash::hash(&[seed, 0x57, 0x41, 0x4C]).to_byte_array();
        let identity_sk = SecretKey::from_slice(&digest).expect("hash output is a valid scalar");
        let secp = Secp256k1::new();
        let identity = PublicKey::from_secret_key(&secp, &identity_sk).serialize();
        Self {
            identity_sk,
            identity,
            leaf_keys: Mutex::new(HashMap::new()),
        }
    }

    /// The compressed identity public key.
    pub fn identity(&self) -> [u8; 33] {
        self.identity
    }

    /// Remember the signing key controlling a leaf.
    pub fn adopt_leaf_key(&self, leaf_id: &str, key: SecretKey) {
        self.leaf_keys
            .lock()
            .expect("wallet lock poisoned")
            .insert(leaf_id.to_owned(), key);
    }

    /// The signing key currently controlling a leaf, if known.
    pub fn leaf_key(&self, leaf_id: &str) -> Option<SecretKey> {
        self.leaf_keys
            .lock()
            .expect("wallet lock poisoned")
            .get(leaf_id)
            .copied()
    }

    /// Deterministic claim key for a leaf: `H(identity_sk || leaf_id)`.
    ///
    /// Deriving deterministically (rather than sampling) is what makes a
    /// retried claim land on the same rotation the first attempt applied.
    pub fn claim_key(&self, leaf_id: &str) -> SecretKey {
        let mut payload = Vec::with_capacity(32 + leaf_id.len());
        payload.extend_from_slice(&self.identity_sk.secret_bytes());
        payload.extend_from_slice(leaf_id.as_bytes());
        let digest = sha256::Hash::hash(&payload).to_byte_array();
        SecretKey::from_slice(&digest).expect("hash output is a valid scalar")
    }

    /// ECDSA-sign `sha256(payload)` with the identity key, compact form.
    pub fn sign_ecdsa(&self, payload: &[u8]) -> Vec<u8> {
        let secp = Secp256k1::new();
        let digest = sha256::Hash::hash(payload).to_byte_array();
        let msg = bitcoin::secp256k1::Message::from_digest(digest);
        secp.sign_ecdsa(&msg, &self.identity_sk)
            .serialize_compact()
            .to_vec()
    }

    pub(crate) fn identity_secret(&self) -> &SecretKey {
        &self.identity_sk
    }
}

/// The public key of a secret, compressed.
pub(crate) fn public_of(sk: &SecretKey) -> [u8; 33] {
    let secp = Secp256k1::new();
    PublicKey::from_secret_key(&secp, sk).serialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallets_are_deterministic_and_distinct() {
        let a1 = SimWallet::new(1);
        let a2 = SimWallet::new(1);
        let b = SimWallet::new(2);
        assert_eq!(a1.identity(), a2.identity());
        assert_ne!(a1.identity(), b.identity());
    }

    #[test]
    fn claim_keys_are_stable_per_leaf() {
        let wallet = SimWallet::new(7);
        assert_eq!(wallet.claim_key("leaf-1"), wallet.claim_key("leaf-1"));
        assert_ne!(wallet.claim_key("leaf-1"), wallet.claim_key("leaf-2"));
    }

    #[test]
    fn ecdsa_signature_verifies() {
        let wallet = SimWallet::new(3);
        let payload = b"leaf-1transfer-1cipher";
        let sig_bytes = wallet.sign_ecdsa(payload);

        let secp = Secp256k1::verification_only();
        let digest = sha256::Hash::hash(payload).to_byte_array();
        let msg = bitcoin::secp256k1::Message::from_digest(digest);
        let sig = bitcoin::secp256k1::ecdsa::Signature::from_compact(&sig_bytes).unwrap();
        let pk = PublicKey::from_slice(&wallet.identity()).unwrap();
        secp.verify_ecdsa(&msg, &sig, &pk).unwrap();
    }
}

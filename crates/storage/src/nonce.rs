//! The signing nonce pool.
//!
//! A FROST nonce pair is reserved at commit time: the commitment half (66
//! bytes, two compressed points) is published, the secret half stays here.
//! The sign round looks the nonce up by its commitment and consumes it --
//! a second consume of the same commitment fails with `NotFound`, which is
//! what makes nonce reuse structurally impossible.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::StorageError;

/// The 66-byte binary form of a signing commitment (`hiding || binding`).
pub type CommitmentBytes = [u8; 66];

/// A reserved nonce pair awaiting its sign round.
#[derive(Debug, Clone)]
pub struct NonceEntry {
    /// Lookup key: the published commitment.
    pub commitment: CommitmentBytes,

    /// The key share this nonce was generated against.
    pub keyshare_id: String,

    /// Serialized secret nonces. Opaque to the store.
    pub nonces: Vec<u8>,
}

/// Storage for reserved signing nonces.
pub trait SigningNoncePool: Send + Sync {
    /// Reserve a nonce: store it under its commitment.
    /// Fails if the commitment is already present.
    fn insert(&self, entry: NonceEntry) -> Result<(), StorageError>;

    /// Consume the nonce for a commitment. Single-use: the entry is
    /// removed, and a second call with the same commitment returns
    /// [`StorageError::NotFound`].
    fn consume(&self, commitment: &CommitmentBytes) -> Result<NonceEntry, StorageError>;

    /// Number of unconsumed nonces in the pool.
    fn unconsumed(&self) -> usize;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory nonce pool. A plain mutex: reserve and consume are both
/// writes, and contention is bounded by signing throughput.
#[derive(Default)]
pub struct MemoryNoncePool {
    entries: Mutex<HashMap<CommitmentBytes, NonceEntry>>,
}

impl MemoryNoncePool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SigningNoncePool for MemoryNoncePool {
    fn insert(&self, entry: NonceEntry) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("nonce pool lock poisoned");
        if entries.contains_key(&entry.commitment) {
            return Err(StorageError::ConstraintViolation("duplicate nonce commitment"));
        }
        entries.insert(entry.commitment, entry);
        Ok(())
    }

    fn consume(&self, commitment: &CommitmentBytes) -> Result<NonceEntry, StorageError> {
        self.entries
            .lock()
            .expect("nonce pool lock poisoned")
            .remove(commitment)
            .ok_or(StorageError::NotFound)
    }

    fn unconsumed(&self) -> usize {
        self.entries.lock().expect("nonce pool lock poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: u8) -> NonceEntry {
        NonceEntry {
            commitment: [tag; 66],
            keyshare_id: format!("ks-{tag}"),
            nonces: vec![tag; 32],
        }
    }

    #[test]
    fn reserve_then_consume() {
        let pool = MemoryNoncePool::new();
        pool.insert(entry(1)).unwrap();
        pool.insert(entry(2)).unwrap();
        assert_eq!(pool.unconsumed(), 2);

        let consumed = pool.consume(&[1; 66]).unwrap();
        assert_eq!(consumed.keyshare_id, "ks-1");
        assert_eq!(pool.unconsumed(), 1);
    }

    #[test]
    fn second_consume_fails() {
        let pool = MemoryNoncePool::new();
        pool.insert(entry(1)).unwrap();

        pool.consume(&[1; 66]).unwrap();
        assert!(matches!(pool.consume(&[1; 66]), Err(StorageError::NotFound)));
    }

    #[test]
    fn unknown_commitment_fails() {
        let pool = MemoryNoncePool::new();
        assert!(matches!(pool.consume(&[9; 66]), Err(StorageError::NotFound)));
    }

    #[test]
    fn duplicate_commitment_rejected() {
        let pool = MemoryNoncePool::new();
        pool.insert(entry(1)).unwrap();
        assert!(matches!(
            pool.insert(entry(1)),
            Err(StorageError::ConstraintViolation(_))
        ));
    }
}

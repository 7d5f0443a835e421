//! Signing key-share rows and the registry.
//!
//! Each leaf is backed by exactly one key share: this operator's slice of
//! the federation's joint secret for that leaf. Shares are never mutated in
//! place -- applying a tweak creates a successor row and retires the old
//! one, so a crashed tweak application can always be distinguished from a
//! completed one.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::StorageError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle status of a key share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyshareStatus {
    /// Provisioned, not yet bound to a leaf.
    Available,
    /// Bound to a leaf and usable for signing.
    InUse,
    /// Superseded by a rotation; kept for audit, never signs again.
    Retired,
}

/// This operator's share of a leaf's joint FROST secret.
#[derive(Debug, Clone)]
pub struct SigningKeyshare {
    /// Unique share identifier (UUID string).
    pub id: String,

    /// Row status.
    pub status: KeyshareStatus,

    /// The secret share scalar. Never serialized onto the wire.
    pub secret_share: [u8; 32],

    /// Public image of every operator's share, keyed by operator id.
    pub public_shares: BTreeMap<String, [u8; 33]>,

    /// Aggregate public key of the operator group for this leaf.
    pub public_key: [u8; 33],

    /// FROST threshold this share was dealt under.
    pub min_signers: usize,

    /// Federation index of the operator that coordinated the deal.
    pub coordinator_index: u16,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Storage for signing key shares.
pub trait KeyshareRegistry: Send + Sync {
    /// Insert a share. Fails on duplicate id.
    fn insert(&self, share: SigningKeyshare) -> Result<(), StorageError>;

    /// Fetch a share by id.
    fn get(&self, id: &str) -> Result<SigningKeyshare, StorageError>;

    /// Move a share from `Available` to `InUse`. Idempotent when already
    /// `InUse`; fails on a retired share.
    fn mark_in_use(&self, id: &str) -> Result<(), StorageError>;

    /// Atomically install `successor` (as `InUse`) and retire `old_id`.
    ///
    /// The successor row carries the tweaked secret; the old share stops
    /// signing the moment this returns.
    fn rotate(&self, old_id: &str, successor: SigningKeyshare) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory keyshare registry.
#[derive(Default)]
pub struct MemoryKeyshareRegistry {
    rows: RwLock<HashMap<String, SigningKeyshare>>,
}

impl MemoryKeyshareRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyshareRegistry for MemoryKeyshareRegistry {
    fn insert(&self, share: SigningKeyshare) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("keyshare lock poisoned");
        if rows.contains_key(&share.id) {
            return Err(StorageError::ConstraintViolation("duplicate keyshare id"));
        }
        rows.insert(share.id.clone(), share);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<SigningKeyshare, StorageError> {
        self.rows
            .read()
            .expect("keyshare lock poisoned")
            .get(id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn mark_in_use(&self, id: &str) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("keyshare lock poisoned");
        let share = rows.get_mut(id).ok_or(StorageError::NotFound)?;
        match share.status {
            KeyshareStatus::Available => {
                share.status = KeyshareStatus::InUse;
                Ok(())
            }
            KeyshareStatus::InUse => Ok(()),
            KeyshareStatus::Retired => Err(StorageError::InvalidState("keyshare retired")),
        }
    }

    fn rotate(&self, old_id: &str, mut successor: SigningKeyshare) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("keyshare lock poisoned");
        let old = rows.get_mut(old_id).ok_or(StorageError::NotFound)?;
        if old.status == KeyshareStatus::Retired {
            return Err(StorageError::InvalidState("keyshare already retired"));
        }
        if rows.contains_key(&successor.id) {
            return Err(StorageError::ConstraintViolation("duplicate keyshare id"));
        }
        // Re-borrow after the duplicate check: both mutations commit together
        // under the single write lock.
        rows.get_mut(old_id).expect("checked above").status = KeyshareStatus::Retired;
        successor.status = KeyshareStatus::InUse;
        rows.insert(successor.id.clone(), successor);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn share(id: &str, byte: u8) -> SigningKeyshare {
        SigningKeyshare {
            id: id.to_owned(),
            status: KeyshareStatus::Available,
            secret_share: [byte; 32],
            public_shares: BTreeMap::new(),
            public_key: [0x02; 33],
            min_signers: 3,
            coordinator_index: 0,
        }
    }

    #[test]
    fn insert_get_mark_in_use() {
        let registry = MemoryKeyshareRegistry::new();
        registry.insert(share("ks-1", 0x11)).unwrap();

        registry.mark_in_use("ks-1").unwrap();
        assert_eq!(registry.get("ks-1").unwrap().status, KeyshareStatus::InUse);

        // Idempotent.
        registry.mark_in_use("ks-1").unwrap();
    }

    #[test]
    fn rotate_retires_old_and_installs_successor() {
        let registry = MemoryKeyshareRegistry::new();
        registry.insert(share("ks-1", 0x11)).unwrap();
        registry.mark_in_use("ks-1").unwrap();

        registry.rotate("ks-1", share("ks-2", 0x22)).unwrap();

        assert_eq!(registry.get("ks-1").unwrap().status, KeyshareStatus::Retired);
        let successor = registry.get("ks-2").unwrap();
        assert_eq!(successor.status, KeyshareStatus::InUse);
        assert_eq!(successor.secret_share, [0x22; 32]);
    }

    #[test]
    fn retired_share_cannot_sign_or_rotate_again() {
        let registry = MemoryKeyshareRegistry::new();
        registry.insert(share("ks-1", 0x11)).unwrap();
        registry.rotate("ks-1", share("ks-2", 0x22)).unwrap();

        assert!(matches!(
            registry.mark_in_use("ks-1"),
            Err(StorageError::InvalidState(_))
        ));
        assert!(matches!(
            registry.rotate("ks-1", share("ks-3", 0x33)),
            Err(StorageError::InvalidState(_))
        ));
    }

    #[test]
    fn rotate_rejects_duplicate_successor_id() {
        let registry = MemoryKeyshareRegistry::new();
        registry.insert(share("ks-1", 0x11)).unwrap();
        registry.insert(share("ks-2", 0x22)).unwrap();

        assert!(matches!(
            registry.rotate("ks-1", share("ks-2", 0x33)),
            Err(StorageError::ConstraintViolation(_))
        ));
        // Old share untouched by the failed rotation.
        assert_eq!(registry.get("ks-1").unwrap().status, KeyshareStatus::Available);
    }
}

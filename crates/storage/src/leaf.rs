//! Tree-node (leaf) rows and the leaf store.
//!
//! A leaf is modifiable only while its status is [`TreeNodeStatus::Available`].
//! Every mutation that hands a leaf to a transfer goes through
//! [`LeafStore::lock_for_update`], which atomically checks the owner and the
//! status before flipping the row into a locked state -- the primary defense
//! against double-transfer and double-claim.

use std::collections::HashMap;
use std::sync::RwLock;

use config::Network;

use crate::StorageError;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeNodeStatus {
    /// Node is being created; not yet spendable.
    Creating,
    /// Node is owned and spendable.
    Available,
    /// Node is locked by an in-flight split.
    SplitLocked,
    /// Node is locked by an in-flight transfer.
    TransferLocked,
    /// Node was split into children and no longer carries value.
    Splitted,
    /// Node value has exited to the base chain.
    Exited,
}

impl TreeNodeStatus {
    /// Whether this status is one of the transient lock states.
    pub fn is_locked(self) -> bool {
        matches!(self, Self::SplitLocked | Self::TransferLocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::SplitLocked => "split_locked",
            Self::TransferLocked => "transfer_locked",
            Self::Splitted => "splitted",
            Self::Exited => "exited",
        }
    }
}

// ---------------------------------------------------------------------------
// TreeNode
// ---------------------------------------------------------------------------

/// A Spark tree node: a leaf or internal node of a deposit tree.
///
/// Parent linkage is by id only; resolve through the store rather than
/// holding node references.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Unique node identifier (UUID string).
    pub id: String,

    /// Tree this node belongs to.
    pub tree_id: String,

    /// Value in satoshis.
    pub value: u64,

    /// Owner's identity public key (33 bytes, compressed).
    pub owner_identity_pubkey: [u8; 33],

    /// Owner's per-leaf signing public key (33 bytes, compressed).
    pub owner_signing_pubkey: [u8; 33],

    /// Joint verifying public key for the leaf:
    /// `owner_signing_pubkey + operator group key`.
    pub verifying_pubkey: [u8; 33],

    /// This operator's key share backing the leaf.
    pub keyshare_id: String,

    /// Raw node transaction.
    pub node_tx: Vec<u8>,

    /// Raw CPFP refund transaction (anchor output variant).
    pub refund_tx: Option<Vec<u8>>,

    /// Raw direct node transaction, if the leaf has a direct spend path.
    pub direct_tx: Option<Vec<u8>>,

    /// Raw direct refund transaction (fee pre-subtracted).
    pub direct_refund_tx: Option<Vec<u8>>,

    /// Raw direct-from-CPFP refund transaction.
    pub direct_from_cpfp_refund_tx: Option<Vec<u8>>,

    /// Parent node id; `None` for roots.
    pub parent_id: Option<String>,

    /// Output index of this node on its parent transaction.
    pub vout: u32,

    /// Network the leaf lives on.
    pub network: Network,

    /// Row status.
    pub status: TreeNodeStatus,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Storage for tree nodes.
pub trait LeafStore: Send + Sync {
    /// Insert a new node. Fails on duplicate id.
    fn insert(&self, node: TreeNode) -> Result<(), StorageError>;

    /// Fetch a node by id.
    fn get(&self, id: &str) -> Result<TreeNode, StorageError>;

    /// All nodes owned by the given identity key, any status.
    fn query_by_owner(&self, owner: &[u8; 33]) -> Result<Vec<TreeNode>, StorageError>;

    /// Atomically lock a node for an operation.
    ///
    /// Succeeds only when the node exists, its owner matches
    /// `expected_owner`, and its status is `Available`; the status then
    /// becomes `target` (which must be a lock state). Errors:
    ///
    /// - [`StorageError::NotFound`] -- no such node
    /// - [`StorageError::ConstraintViolation`] -- owner mismatch
    /// - [`StorageError::InvalidState`] -- not `Available`
    fn lock_for_update(
        &self,
        id: &str,
        expected_owner: &[u8; 33],
        target: TreeNodeStatus,
    ) -> Result<TreeNode, StorageError>;

    /// Release a lock, returning the node to `Available` with its owner
    /// unchanged. No-op if the node is already `Available`.
    fn unlock(&self, id: &str) -> Result<(), StorageError>;

    /// Set the row status unconditionally.
    fn update_status(&self, id: &str, status: TreeNodeStatus) -> Result<(), StorageError>;

    /// Move ownership to a new identity and signing key.
    fn set_owner(
        &self,
        id: &str,
        identity: [u8; 33],
        signing_pubkey: [u8; 33],
    ) -> Result<(), StorageError>;

    /// Point the leaf at a rotated key share.
    fn rotate_keyshare(&self, id: &str, keyshare_id: &str) -> Result<(), StorageError>;

    /// Replace the stored refund transactions.
    fn update_refund_txs(
        &self,
        id: &str,
        cpfp: Vec<u8>,
        direct: Option<Vec<u8>>,
        direct_from_cpfp: Option<Vec<u8>>,
    ) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory leaf store backed by `RwLock<HashMap>`.
///
/// A single write lock spans every check-then-mutate sequence, giving the
/// same atomicity as a row-level `FOR UPDATE`.
#[derive(Default)]
pub struct MemoryLeafStore {
    rows: RwLock<HashMap<String, TreeNode>>,
}

impl MemoryLeafStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeafStore for MemoryLeafStore {
    fn insert(&self, node: TreeNode) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("leaf store lock poisoned");
        if rows.contains_key(&node.id) {
            return Err(StorageError::ConstraintViolation("duplicate node id"));
        }
        rows.insert(node.id.clone(), node);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<TreeNode, StorageError> {
        self.rows
            .read()
            .expect("leaf store lock poisoned")
            .get(id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn query_by_owner(&self, owner: &[u8; 33]) -> Result<Vec<TreeNode>, StorageError> {
        let rows = self.rows.read().expect("leaf store lock poisoned");
        let mut out: Vec<TreeNode> = rows
            .values()
            .filter(|n| &n.owner_identity_pubkey == owner)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn lock_for_update(
        &self,
        id: &str,
        expected_owner: &[u8; 33],
        target: TreeNodeStatus,
    ) -> Result<TreeNode, StorageError> {
        if !target.is_locked() {
            return Err(StorageError::InvalidState("target is not a lock state"));
        }
        let mut rows = self.rows.write().expect("leaf store lock poisoned");
        let node = rows.get_mut(id).ok_or(StorageError::NotFound)?;
        if &node.owner_identity_pubkey != expected_owner {
            return Err(StorageError::ConstraintViolation("leaf owner mismatch"));
        }
        if node.status != TreeNodeStatus::Available {
            return Err(StorageError::InvalidState("leaf not available"));
        }
        node.status = target;
        Ok(node.clone())
    }

    fn unlock(&self, id: &str) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("leaf store lock poisoned");
        let node = rows.get_mut(id).ok_or(StorageError::NotFound)?;
        if node.status.is_locked() {
            node.status = TreeNodeStatus::Available;
        }
        Ok(())
    }

    fn update_status(&self, id: &str, status: TreeNodeStatus) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("leaf store lock poisoned");
        let node = rows.get_mut(id).ok_or(StorageError::NotFound)?;
        node.status = status;
        Ok(())
    }

    fn set_owner(
        &self,
        id: &str,
        identity: [u8; 33],
        signing_pubkey: [u8; 33],
    ) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("leaf store lock poisoned");
        let node = rows.get_mut(id).ok_or(StorageError::NotFound)?;
        node.owner_identity_pubkey = identity;
        node.owner_signing_pubkey = signing_pubkey;
        Ok(())
    }

    fn rotate_keyshare(&self, id: &str, keyshare_id: &str) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("leaf store lock poisoned");
        let node = rows.get_mut(id).ok_or(StorageError::NotFound)?;
        node.keyshare_id = keyshare_id.to_owned();
        Ok(())
    }

    fn update_refund_txs(
        &self,
        id: &str,
        cpfp: Vec<u8>,
        direct: Option<Vec<u8>>,
        direct_from_cpfp: Option<Vec<u8>>,
    ) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("leaf store lock poisoned");
        let node = rows.get_mut(id).ok_or(StorageError::NotFound)?;
        node.refund_tx = Some(cpfp);
        if direct.is_some() {
            node.direct_refund_tx = direct;
        }
        if direct_from_cpfp.is_some() {
            node.direct_from_cpfp_refund_tx = direct_from_cpfp;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, owner: u8) -> TreeNode {
        TreeNode {
            id: id.to_owned(),
            tree_id: "tree-1".to_owned(),
            value: 1000,
            owner_identity_pubkey: [owner; 33],
            owner_signing_pubkey: [owner.wrapping_add(1); 33],
            verifying_pubkey: [0x02; 33],
            keyshare_id: format!("ks-{id}"),
            node_tx: vec![0x01],
            refund_tx: None,
            direct_tx: None,
            direct_refund_tx: None,
            direct_from_cpfp_refund_tx: None,
            parent_id: None,
            vout: 0,
            network: Network::Regtest,
            status: TreeNodeStatus::Available,
        }
    }

    #[test]
    fn insert_and_get() {
        let store = MemoryLeafStore::new();
        store.insert(node("a", 3)).unwrap();
        assert_eq!(store.get("a").unwrap().value, 1000);
        assert!(matches!(store.get("b"), Err(StorageError::NotFound)));
    }

    #[test]
    fn duplicate_insert_rejected() {
        let store = MemoryLeafStore::new();
        store.insert(node("a", 3)).unwrap();
        assert!(matches!(
            store.insert(node("a", 3)),
            Err(StorageError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn lock_requires_available_status() {
        let store = MemoryLeafStore::new();
        store.insert(node("a", 3)).unwrap();

        let locked = store
            .lock_for_update("a", &[3; 33], TreeNodeStatus::TransferLocked)
            .unwrap();
        assert_eq!(locked.status, TreeNodeStatus::TransferLocked);

        // Second lock fails: no longer available.
        assert!(matches!(
            store.lock_for_update("a", &[3; 33], TreeNodeStatus::TransferLocked),
            Err(StorageError::InvalidState(_))
        ));
    }

    #[test]
    fn lock_requires_matching_owner() {
        let store = MemoryLeafStore::new();
        store.insert(node("a", 3)).unwrap();
        assert!(matches!(
            store.lock_for_update("a", &[9; 33], TreeNodeStatus::TransferLocked),
            Err(StorageError::ConstraintViolation(_))
        ));
        // The failed attempt must not have locked the row.
        assert_eq!(store.get("a").unwrap().status, TreeNodeStatus::Available);
    }

    #[test]
    fn lock_rejects_non_lock_target() {
        let store = MemoryLeafStore::new();
        store.insert(node("a", 3)).unwrap();
        assert!(
            store
                .lock_for_update("a", &[3; 33], TreeNodeStatus::Exited)
                .is_err()
        );
    }

    #[test]
    fn unlock_restores_available() {
        let store = MemoryLeafStore::new();
        store.insert(node("a", 3)).unwrap();
        store
            .lock_for_update("a", &[3; 33], TreeNodeStatus::TransferLocked)
            .unwrap();
        store.unlock("a").unwrap();
        assert_eq!(store.get("a").unwrap().status, TreeNodeStatus::Available);

        // Unlock of an already-available row is a no-op.
        store.unlock("a").unwrap();
        assert_eq!(store.get("a").unwrap().status, TreeNodeStatus::Available);
    }

    #[test]
    fn ownership_rotation() {
        let store = MemoryLeafStore::new();
        store.insert(node("a", 3)).unwrap();

        store.set_owner("a", [7; 33], [8; 33]).unwrap();
        store.rotate_keyshare("a", "ks-new").unwrap();

        let updated = store.get("a").unwrap();
        assert_eq!(updated.owner_identity_pubkey, [7; 33]);
        assert_eq!(updated.owner_signing_pubkey, [8; 33]);
        assert_eq!(updated.keyshare_id, "ks-new");

        assert_eq!(store.query_by_owner(&[3; 33]).unwrap().len(), 0);
        assert_eq!(store.query_by_owner(&[7; 33]).unwrap().len(), 1);
    }

    #[test]
    fn refund_tx_update_preserves_absent_variants() {
        let store = MemoryLeafStore::new();
        let mut n = node("a", 3);
        n.direct_refund_tx = Some(vec![0xAA]);
        store.insert(n).unwrap();

        store.update_refund_txs("a", vec![0x01], None, Some(vec![0x02])).unwrap();

        let updated = store.get("a").unwrap();
        assert_eq!(updated.refund_tx, Some(vec![0x01]));
        // Passing None leaves the existing direct refund untouched.
        assert_eq!(updated.direct_refund_tx, Some(vec![0xAA]));
        assert_eq!(updated.direct_from_cpfp_refund_tx, Some(vec![0x02]));
    }
}

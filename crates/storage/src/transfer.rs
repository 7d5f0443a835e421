//! Transfer rows, claim locks, and cooperative-exit bookkeeping.
//!
//! The transfer row is the authoritative coordination object: every phase
//! of the multi-operator protocol is a persisted status transition, and
//! resume logic consults the status column rather than any in-memory
//! continuation. All transitions for one transfer serialize on the row
//! (closure-scoped mutation under the store's write lock); racing claimers
//! additionally contend on an explicit claim lock so that exactly one
//! wins and the rest observe a clean conflict.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use config::Network;

use crate::StorageError;

// ---------------------------------------------------------------------------
// Status & type
// ---------------------------------------------------------------------------

/// Phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Leaves locked on all operators; refund txs pending signatures.
    SenderInitiated,
    /// Refund txs signed; awaiting the sender's key-tweak payload
    /// (and, for cooperative exits, the chain confirmation gate).
    SenderKeyTweakPending,
    /// Sender rotated their share to the receiver-controlled share.
    SenderKeyTweaked,
    /// Receiver claimed and rotated shares to their own key.
    ReceiverKeyTweaked,
    /// Receiver's refund txs signed; awaiting finalize.
    ReceiverRefundSigned,
    /// Terminal: claim finalized, leaves live under the receiver.
    Completed,
    /// Terminal: cancelled before the sender tweaked.
    Cancelled,
    /// Terminal: expired before the sender tweaked.
    Expired,
}

impl TransferStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SenderInitiated => "sender_initiated",
            Self::SenderKeyTweakPending => "sender_key_tweak_pending",
            Self::SenderKeyTweaked => "sender_key_tweaked",
            Self::ReceiverKeyTweaked => "receiver_key_tweaked",
            Self::ReceiverRefundSigned => "receiver_refund_signed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub const fn to_proto(self) -> i32 {
        match self {
            Self::SenderInitiated => 0,
            Self::SenderKeyTweakPending => 1,
            Self::SenderKeyTweaked => 2,
            Self::ReceiverKeyTweaked => 3,
            Self::ReceiverRefundSigned => 4,
            Self::Completed => 5,
            Self::Cancelled => 6,
            Self::Expired => 7,
        }
    }

    pub const fn from_proto(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::SenderInitiated),
            1 => Some(Self::SenderKeyTweakPending),
            2 => Some(Self::SenderKeyTweaked),
            3 => Some(Self::ReceiverKeyTweaked),
            4 => Some(Self::ReceiverRefundSigned),
            5 => Some(Self::Completed),
            6 => Some(Self::Cancelled),
            7 => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Kind of transfer. The coordinator runs one state machine parameterized
/// by the predicates below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Plain sender-to-receiver leaf transfer.
    Transfer,
    /// Inbound half of an atomic swap.
    CounterSwap,
    /// Transfer gated on an on-chain exit transaction confirming.
    CooperativeExit,
    /// Transfer gated on a Lightning preimage being revealed.
    PreimageSwap,
}

impl TransferType {
    /// Whether the sender-tweak gate waits for a base-chain confirmation.
    pub fn requires_chain_confirmation(self) -> bool {
        matches!(self, Self::CooperativeExit)
    }

    /// Whether claiming requires a revealed preimage.
    pub fn requires_preimage(self) -> bool {
        matches!(self, Self::PreimageSwap)
    }

    pub const fn to_proto(self) -> i32 {
        match self {
            Self::Transfer => 0,
            Self::CounterSwap => 1,
            Self::CooperativeExit => 2,
            Self::PreimageSwap => 3,
        }
    }

    pub const fn from_proto(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Transfer),
            1 => Some(Self::CounterSwap),
            2 => Some(Self::CooperativeExit),
            3 => Some(Self::PreimageSwap),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Per-leaf state carried by a transfer.
#[derive(Debug, Clone)]
pub struct TransferLeaf {
    /// The leaf being sent.
    pub leaf_id: String,

    /// Sender-provided ciphertext of the new leaf secret for the
    /// receiver. Opaque to operators; passed through on queries.
    pub secret_cipher: Vec<u8>,

    /// Sender's ECDSA signature binding `leaf_id || transfer_id ||
    /// secret_cipher`. Passed through for receiver-side verification.
    pub sender_signature: Vec<u8>,

    /// Pending CPFP refund transaction for this generation.
    pub pending_cpfp_refund_tx: Vec<u8>,

    /// Pending direct refund transaction, if the leaf has a direct path.
    pub pending_direct_refund_tx: Option<Vec<u8>>,

    /// Pending direct-from-CPFP refund transaction.
    pub pending_direct_from_cpfp_refund_tx: Option<Vec<u8>>,

    /// Final aggregated signature over the CPFP refund, once known.
    pub cpfp_refund_signature: Option<Vec<u8>>,

    /// Final aggregated signature over the direct refund.
    pub direct_refund_signature: Option<Vec<u8>>,

    /// Final aggregated signature over the direct-from-CPFP refund.
    pub direct_from_cpfp_refund_signature: Option<Vec<u8>>,

    /// This operator applied the sender's key tweak for this leaf.
    pub sender_tweak_applied: bool,

    /// This operator applied the receiver's key tweak for this leaf.
    pub receiver_tweak_applied: bool,
}

impl TransferLeaf {
    /// Fresh per-leaf state for a new transfer.
    pub fn new(
        leaf_id: String,
        cpfp_refund_tx: Vec<u8>,
        direct_refund_tx: Option<Vec<u8>>,
        direct_from_cpfp_refund_tx: Option<Vec<u8>>,
    ) -> Self {
        Self {
            leaf_id,
            secret_cipher: Vec::new(),
            sender_signature: Vec::new(),
            pending_cpfp_refund_tx: cpfp_refund_tx,
            pending_direct_refund_tx: direct_refund_tx,
            pending_direct_from_cpfp_refund_tx: direct_from_cpfp_refund_tx,
            cpfp_refund_signature: None,
            direct_refund_signature: None,
            direct_from_cpfp_refund_signature: None,
            sender_tweak_applied: false,
            receiver_tweak_applied: false,
        }
    }
}

/// A transfer row as persisted by one operator.
#[derive(Debug, Clone)]
pub struct TransferRow {
    /// Transfer id (UUID string), assigned by the sender.
    pub id: String,

    /// Kind of transfer.
    pub transfer_type: TransferType,

    /// Current phase.
    pub status: TransferStatus,

    /// Sender identity public key.
    pub sender_identity: [u8; 33],

    /// Receiver identity public key.
    pub receiver_identity: [u8; 33],

    /// UNIX seconds after which the transfer expires if untweaked.
    pub expiry_time: u64,

    /// Network of the leaves being sent.
    pub network: Network,

    /// Leaves being sent, in the order the sender supplied them.
    pub leaves: Vec<TransferLeaf>,

    /// Payment hash for [`TransferType::PreimageSwap`].
    pub payment_hash: Option<[u8; 32]>,

    /// Whether the preimage for `payment_hash` has been revealed.
    pub preimage_revealed: bool,

    /// Encoded signing results from the sender-side refund signing,
    /// kept so retries return the existing signatures instead of
    /// consuming fresh nonces. Opaque to the store.
    pub signing_results_blob: Option<Vec<u8>>,

    /// Encoded signing results from the claim-side refund signing.
    pub claim_signing_results_blob: Option<Vec<u8>>,
}

impl TransferRow {
    /// The transfer is past its expiry and the sender has not tweaked.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiry_time && !self.sender_tweaked() && !self.status.is_terminal()
    }

    /// Every leaf has the sender's tweak applied on this operator.
    pub fn sender_tweaked(&self) -> bool {
        !self.leaves.is_empty() && self.leaves.iter().all(|l| l.sender_tweak_applied)
    }

    /// Every leaf has the receiver's tweak applied on this operator.
    pub fn receiver_tweaked(&self) -> bool {
        !self.leaves.is_empty() && self.leaves.iter().all(|l| l.receiver_tweak_applied)
    }

    /// Find a leaf entry by id.
    pub fn leaf(&self, leaf_id: &str) -> Option<&TransferLeaf> {
        self.leaves.iter().find(|l| l.leaf_id == leaf_id)
    }
}

/// Cooperative-exit bookkeeping attached to a transfer.
#[derive(Debug, Clone)]
pub struct CooperativeExitRow {
    /// Exit id (UUID string), assigned by the service provider.
    pub exit_id: String,

    /// The transfer this exit gates.
    pub transfer_id: String,

    /// Txid of the on-chain exit transaction.
    pub exit_txid: [u8; 32],

    /// Block height the exit tx confirmed at, while known.
    pub confirmation_height: Option<u64>,

    /// The confirmation threshold has been reached (and not reorged away).
    pub chain_confirmed: bool,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Storage for transfers and cooperative exits.
pub trait TransferStore: Send + Sync {
    /// Create a transfer row. Fails if the id exists.
    fn create(&self, row: TransferRow) -> Result<(), StorageError>;

    /// Fetch a transfer by id.
    fn get(&self, id: &str) -> Result<TransferRow, StorageError>;

    /// Mutate a transfer under the row lock. The closure's error aborts
    /// the mutation. Returns the updated row.
    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut TransferRow) -> Result<(), StorageError>,
    ) -> Result<TransferRow, StorageError>;

    /// Atomically transition the status: fails with
    /// [`StorageError::InvalidState`] unless the current status is in
    /// `expected`.
    fn compare_and_swap_status(
        &self,
        id: &str,
        expected: &[TransferStatus],
        new: TransferStatus,
    ) -> Result<TransferRow, StorageError>;

    /// Transfers claimable (or resumable) by `receiver` on `network`:
    /// status in `{SenderKeyTweaked, ReceiverKeyTweaked,
    /// ReceiverRefundSigned}`.
    fn query_pending(
        &self,
        receiver: &[u8; 33],
        network: Network,
    ) -> Result<Vec<TransferRow>, StorageError>;

    /// Paginated history for an identity (as sender or receiver),
    /// oldest first, optionally filtered by type. Returns the page and
    /// the next offset.
    fn query_all(
        &self,
        identity: &[u8; 33],
        limit: usize,
        offset: usize,
        types: &[TransferType],
    ) -> Result<(Vec<TransferRow>, usize), StorageError>;

    /// Acquire the claim lock for a transfer. Returns `false` when a
    /// concurrent claimer holds it.
    fn try_lock_claim(&self, id: &str) -> bool;

    /// Release the claim lock.
    fn unlock_claim(&self, id: &str);

    /// Transfers that are past expiry and still cancellable.
    fn expirable(&self, now: u64) -> Result<Vec<TransferRow>, StorageError>;

    // -- Cooperative exits --------------------------------------------------

    /// Record a cooperative exit. Fails on a duplicate exit id.
    fn insert_exit(&self, exit: CooperativeExitRow) -> Result<(), StorageError>;

    /// The exit gating a transfer, if any.
    fn exit_for_transfer(&self, transfer_id: &str)
        -> Result<Option<CooperativeExitRow>, StorageError>;

    /// Exits whose transfer is still live and therefore worth watching.
    fn watched_exits(&self) -> Result<Vec<CooperativeExitRow>, StorageError>;

    /// Update an exit's confirmation observation.
    fn set_exit_confirmation(
        &self,
        exit_id: &str,
        height: Option<u64>,
        chain_confirmed: bool,
    ) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory transfer store.
#[derive(Default)]
pub struct MemoryTransferStore {
    rows: RwLock<HashMap<String, TransferRow>>,
    /// Creation order, for stable pagination.
    order: RwLock<Vec<String>>,
    claim_locks: Mutex<HashSet<String>>,
    exits: RwLock<HashMap<String, CooperativeExitRow>>,
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferStore for MemoryTransferStore {
    fn create(&self, row: TransferRow) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("transfer lock poisoned");
        if rows.contains_key(&row.id) {
            return Err(StorageError::ConstraintViolation("duplicate transfer id"));
        }
        self.order
            .write()
            .expect("transfer order lock poisoned")
            .push(row.id.clone());
        rows.insert(row.id.clone(), row);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<TransferRow, StorageError> {
        self.rows
            .read()
            .expect("transfer lock poisoned")
            .get(id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut TransferRow) -> Result<(), StorageError>,
    ) -> Result<TransferRow, StorageError> {
        let mut rows = self.rows.write().expect("transfer lock poisoned");
        let row = rows.get_mut(id).ok_or(StorageError::NotFound)?;
        let mut staged = row.clone();
        f(&mut staged)?;
        *row = staged;
        Ok(row.clone())
    }

    fn compare_and_swap_status(
        &self,
        id: &str,
        expected: &[TransferStatus],
        new: TransferStatus,
    ) -> Result<TransferRow, StorageError> {
        let mut rows = self.rows.write().expect("transfer lock poisoned");
        let row = rows.get_mut(id).ok_or(StorageError::NotFound)?;
        if !expected.contains(&row.status) {
            return Err(StorageError::InvalidState("unexpected transfer status"));
        }
        row.status = new;
        Ok(row.clone())
    }

    fn query_pending(
        &self,
        receiver: &[u8; 33],
        network: Network,
    ) -> Result<Vec<TransferRow>, StorageError> {
        const PENDING: [TransferStatus; 3] = [
            TransferStatus::SenderKeyTweaked,
            TransferStatus::ReceiverKeyTweaked,
            TransferStatus::ReceiverRefundSigned,
        ];
        let rows = self.rows.read().expect("transfer lock poisoned");
        let order = self.order.read().expect("transfer order lock poisoned");
        Ok(order
            .iter()
            .filter_map(|id| rows.get(id))
            .filter(|t| {
                &t.receiver_identity == receiver
                    && t.network == network
                    && PENDING.contains(&t.status)
            })
            .cloned()
            .collect())
    }

    fn query_all(
        &self,
        identity: &[u8; 33],
        limit: usize,
        offset: usize,
        types: &[TransferType],
    ) -> Result<(Vec<TransferRow>, usize), StorageError> {
        let rows = self.rows.read().expect("transfer lock poisoned");
        let order = self.order.read().expect("transfer order lock poisoned");
        let matching: Vec<&TransferRow> = order
            .iter()
            .filter_map(|id| rows.get(id))
            .filter(|t| {
                (&t.sender_identity == identity || &t.receiver_identity == identity)
                    && (types.is_empty() || types.contains(&t.transfer_type))
            })
            .collect();

        let page: Vec<TransferRow> = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let next_offset = offset + page.len();
        Ok((page, next_offset))
    }

    fn try_lock_claim(&self, id: &str) -> bool {
        self.claim_locks
            .lock()
            .expect("claim lock poisoned")
            .insert(id.to_owned())
    }

    fn unlock_claim(&self, id: &str) {
        self.claim_locks
            .lock()
            .expect("claim lock poisoned")
            .remove(id);
    }

    fn expirable(&self, now: u64) -> Result<Vec<TransferRow>, StorageError> {
        let rows = self.rows.read().expect("transfer lock poisoned");
        Ok(rows.values().filter(|t| t.is_expired(now)).cloned().collect())
    }

    fn insert_exit(&self, exit: CooperativeExitRow) -> Result<(), StorageError> {
        let mut exits = self.exits.write().expect("exit lock poisoned");
        if exits.contains_key(&exit.exit_id) {
            return Err(StorageError::ConstraintViolation("duplicate exit id"));
        }
        exits.insert(exit.exit_id.clone(), exit);
        Ok(())
    }

    fn exit_for_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Option<CooperativeExitRow>, StorageError> {
        let exits = self.exits.read().expect("exit lock poisoned");
        Ok(exits.values().find(|e| e.transfer_id == transfer_id).cloned())
    }

    fn watched_exits(&self) -> Result<Vec<CooperativeExitRow>, StorageError> {
        let exits = self.exits.read().expect("exit lock poisoned");
        let rows = self.rows.read().expect("transfer lock poisoned");
        Ok(exits
            .values()
            .filter(|e| {
                rows.get(&e.transfer_id)
                    .map(|t| !t.status.is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    fn set_exit_confirmation(
        &self,
        exit_id: &str,
        height: Option<u64>,
        chain_confirmed: bool,
    ) -> Result<(), StorageError> {
        let mut exits = self.exits.write().expect("exit lock poisoned");
        let exit = exits.get_mut(exit_id).ok_or(StorageError::NotFound)?;
        exit.confirmation_height = height;
        exit.chain_confirmed = chain_confirmed;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, transfer_type: TransferType, sender: u8, receiver: u8) -> TransferRow {
        TransferRow {
            id: id.to_owned(),
            transfer_type,
            status: TransferStatus::SenderInitiated,
            sender_identity: [sender; 33],
            receiver_identity: [receiver; 33],
            expiry_time: 10_000,
            network: Network::Regtest,
            leaves: vec![TransferLeaf::new("leaf-1".to_owned(), vec![0x01], None, None)],
            payment_hash: None,
            preimage_revealed: false,
            signing_results_blob: None,
            claim_signing_results_blob: None,
        }
    }

    #[test]
    fn create_get_duplicate() {
        let store = MemoryTransferStore::new();
        store.create(row("t1", TransferType::Transfer, 1, 2)).unwrap();
        assert_eq!(store.get("t1").unwrap().status, TransferStatus::SenderInitiated);
        assert!(matches!(
            store.create(row("t1", TransferType::Transfer, 1, 2)),
            Err(StorageError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn cas_status_enforces_expected() {
        let store = MemoryTransferStore::new();
        store.create(row("t1", TransferType::Transfer, 1, 2)).unwrap();

        store
            .compare_and_swap_status(
                "t1",
                &[TransferStatus::SenderInitiated],
                TransferStatus::SenderKeyTweakPending,
            )
            .unwrap();

        assert!(matches!(
            store.compare_and_swap_status(
                "t1",
                &[TransferStatus::SenderInitiated],
                TransferStatus::SenderKeyTweaked,
            ),
            Err(StorageError::InvalidState(_))
        ));
    }

    #[test]
    fn update_closure_error_aborts_mutation() {
        let store = MemoryTransferStore::new();
        store.create(row("t1", TransferType::Transfer, 1, 2)).unwrap();

        let result = store.update("t1", &mut |t| {
            t.leaves[0].sender_tweak_applied = true;
            Err(StorageError::InvalidState("abort"))
        });
        assert!(result.is_err());
        assert!(!store.get("t1").unwrap().leaves[0].sender_tweak_applied);
    }

    #[test]
    fn query_pending_filters_status_receiver_network() {
        let store = MemoryTransferStore::new();
        store.create(row("t1", TransferType::Transfer, 1, 2)).unwrap();
        store.create(row("t2", TransferType::Transfer, 1, 2)).unwrap();
        store.create(row("t3", TransferType::Transfer, 1, 9)).unwrap();

        store
            .compare_and_swap_status("t1", &[TransferStatus::SenderInitiated], TransferStatus::SenderKeyTweaked)
            .unwrap();
        store
            .compare_and_swap_status("t3", &[TransferStatus::SenderInitiated], TransferStatus::SenderKeyTweaked)
            .unwrap();

        let pending = store.query_pending(&[2; 33], Network::Regtest).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t1");

        assert!(store.query_pending(&[2; 33], Network::Mainnet).unwrap().is_empty());
    }

    #[test]
    fn query_all_paginates_in_creation_order() {
        let store = MemoryTransferStore::new();
        store.create(row("t1", TransferType::Transfer, 1, 2)).unwrap();
        store.create(row("t2", TransferType::CounterSwap, 1, 3)).unwrap();
        store.create(row("t3", TransferType::Transfer, 4, 1)).unwrap();

        let (page, next) = store.query_all(&[1; 33], 1, 0, &[]).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "t1");
        assert_eq!(next, 1);

        let (page, next) = store.query_all(&[1; 33], 1, next, &[]).unwrap();
        assert_eq!(page[0].id, "t2");
        assert_eq!(next, 2);

        let (page, _) = store.query_all(&[1; 33], 100, 0, &[]).unwrap();
        assert_eq!(page.len(), 3);

        let (swaps, _) = store
            .query_all(&[1; 33], 100, 0, &[TransferType::CounterSwap])
            .unwrap();
        assert_eq!(swaps.len(), 1);
        assert_eq!(swaps[0].id, "t2");
    }

    #[test]
    fn claim_lock_is_exclusive() {
        let store = MemoryTransferStore::new();
        assert!(store.try_lock_claim("t1"));
        assert!(!store.try_lock_claim("t1"));
        store.unlock_claim("t1");
        assert!(store.try_lock_claim("t1"));
    }

    #[test]
    fn expirable_respects_tweak_and_terminal_states() {
        let store = MemoryTransferStore::new();
        store.create(row("t1", TransferType::Transfer, 1, 2)).unwrap();
        store.create(row("t2", TransferType::Transfer, 1, 2)).unwrap();
        store.create(row("t3", TransferType::Transfer, 1, 2)).unwrap();

        // t2 tweaked: immune to expiry.
        store
            .update("t2", &mut |t| {
                for leaf in &mut t.leaves {
                    leaf.sender_tweak_applied = true;
                }
                Ok(())
            })
            .unwrap();
        // t3 already cancelled.
        store
            .compare_and_swap_status("t3", &[TransferStatus::SenderInitiated], TransferStatus::Cancelled)
            .unwrap();

        let expired = store.expirable(20_000).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "t1");

        assert!(store.expirable(5_000).unwrap().is_empty());
    }

    #[test]
    fn exit_rows_follow_transfer_liveness() {
        let store = MemoryTransferStore::new();
        store.create(row("t1", TransferType::CooperativeExit, 1, 2)).unwrap();
        store
            .insert_exit(CooperativeExitRow {
                exit_id: "e1".to_owned(),
                transfer_id: "t1".to_owned(),
                exit_txid: [0xAB; 32],
                confirmation_height: None,
                chain_confirmed: false,
            })
            .unwrap();

        assert_eq!(store.watched_exits().unwrap().len(), 1);
        assert!(store.exit_for_transfer("t1").unwrap().is_some());
        assert!(store.exit_for_transfer("t9").unwrap().is_none());

        store.set_exit_confirmation("e1", Some(120), true).unwrap();
        let exit = store.exit_for_transfer("t1").unwrap().unwrap();
        assert!(exit.chain_confirmed);
        assert_eq!(exit.confirmation_height, Some(120));

        store
            .compare_and_swap_status("t1", &[TransferStatus::SenderInitiated], TransferStatus::Cancelled)
            .unwrap();
        assert!(store.watched_exits().unwrap().is_empty());
    }
}

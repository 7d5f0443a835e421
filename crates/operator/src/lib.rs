//! Spark signing-operator core.
//!
//! A Spark federation custodies off-chain leaves jointly with their
//! owners: each leaf's verifying key is `owner key + operator group key`,
//! and value moves by rotating operator key shares while re-signing refund
//! transactions with decremented timelocks. This crate implements the
//! operator side of that protocol:
//!
//! - [`OperatorNode`] -- one operator's state and follower handlers
//!   (leaf locking, tweak verification and application, FROST commit and
//!   sign rounds, rollback, claim settlement)
//! - [`Coordinator`] -- the orchestrator role, generic over the
//!   [`FollowerClient`](transport::FollowerClient) fan-out seam: transfer
//!   initiation, key-tweak distribution, cancel/expiry, queries, and the
//!   claim path
//! - [`watcher::ChainWatcher`] -- the background task gating cooperative
//!   exits on base-chain confirmations
//! - [`cluster::LocalCluster`] -- an in-process federation used by the
//!   integration tests and the simnet binary
//!
//! Every phase of a transfer is a persisted status transition; recovery
//! after a crash or a lost reply consults the transfer row, never an
//! in-memory continuation.

pub mod bitcoin_tx;
pub mod chain;
pub mod claim;
pub mod cluster;
mod convert;
pub mod coordinator;
pub mod error;
pub mod follower;
pub mod signing;
pub mod watcher;

pub use coordinator::Coordinator;
pub use error::OperatorError;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use config::{FederationConfig, Knobs};
use storage::journal::{JournalEvent, TransferJournal};
use storage::keyshare::{KeyshareRegistry, MemoryKeyshareRegistry};
use storage::leaf::{LeafStore, MemoryLeafStore};
use storage::nonce::{MemoryNoncePool, SigningNoncePool};
use storage::transfer::{MemoryTransferStore, TransferStore};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// The persistent stores backing one operator.
#[derive(Clone)]
pub struct Stores {
    pub leaves: Arc<dyn LeafStore>,
    pub keyshares: Arc<dyn KeyshareRegistry>,
    pub nonces: Arc<dyn SigningNoncePool>,
    pub transfers: Arc<dyn TransferStore>,
}

impl Stores {
    /// Fresh in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            leaves: Arc::new(MemoryLeafStore::new()),
            keyshares: Arc::new(MemoryKeyshareRegistry::new()),
            nonces: Arc::new(MemoryNoncePool::new()),
            transfers: Arc::new(MemoryTransferStore::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// OperatorNode
// ---------------------------------------------------------------------------

struct NodeInner {
    config: FederationConfig,
    self_index: u16,
    knobs: Knobs,
    stores: Stores,
    journal: Option<TransferJournal>,
    cancel: CancellationToken,
}

/// One signing operator's state. Cheap to clone (wraps an `Arc`).
///
/// The node is the *follower* role: it owns the stores and implements the
/// internal service handlers. Wrap it in a [`Coordinator`] to drive the
/// orchestrator role for client-facing requests.
#[derive(Clone)]
pub struct OperatorNode {
    inner: Arc<NodeInner>,
}

impl OperatorNode {
    pub fn new(config: FederationConfig, self_index: u16, stores: Stores) -> Self {
        debug_assert!((self_index as usize) < config.num_operators());
        Self {
            inner: Arc::new(NodeInner {
                config,
                self_index,
                knobs: Knobs::new(),
                stores,
                journal: None,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Attach a durable transfer journal. Call before sharing the node.
    pub fn with_journal(config: FederationConfig, self_index: u16, stores: Stores, journal: TransferJournal) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                config,
                self_index,
                knobs: Knobs::new(),
                stores,
                journal: Some(journal),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// This operator's stable id in the federation.
    pub fn id(&self) -> &str {
        &self.inner.config.operators()[self.inner.self_index as usize].id
    }

    /// This operator's zero-based federation index.
    pub fn self_index(&self) -> u16 {
        self.inner.self_index
    }

    pub fn config(&self) -> &FederationConfig {
        &self.inner.config
    }

    pub fn knobs(&self) -> &Knobs {
        &self.inner.knobs
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// The durable transfer journal, when one is attached.
    pub fn transfer_journal(&self) -> Option<&TransferJournal> {
        self.inner.journal.as_ref()
    }

    /// Best-effort journal append; a journal failure never fails the
    /// transition it records.
    pub(crate) fn journal(&self, transfer_id: &str, event: JournalEvent) {
        if let Some(journal) = &self.inner.journal {
            if let Err(e) = journal.append(transfer_id, event) {
                tracing::warn!(operator = self.id(), transfer_id, %e, "journal append failed");
            }
        }
    }
}

impl std::fmt::Debug for OperatorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorNode")
            .field("id", &self.id())
            .field("index", &self.inner.self_index)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Small shared helpers
// ---------------------------------------------------------------------------

/// Current UNIX time in seconds.
pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs()
}

/// Generate a UUIDv4 string from thread-local randomness.
pub(crate) fn generate_uuid() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
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

/// Parse a 33-byte compressed public key from wire bytes.
pub(crate) fn pubkey33(bytes: &[u8], what: &'static str) -> Result<[u8; 33], OperatorError> {
    bytes
        .try_into()
        .map_err(|_| OperatorError::InvalidArgument(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uuids_are_v4_shaped_and_unique() {
        let a = generate_uuid();
        let b = generate_uuid();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert_eq!(a.as_bytes()[14], b'4');
    }

    #[test]
    fn pubkey33_rejects_wrong_length() {
        assert!(pubkey33(&[0u8; 32], "key").is_err());
        assert!(pubkey33(&[2u8; 33], "key").is_ok());
    }
}

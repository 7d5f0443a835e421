//! Base-chain access for the chain watcher.
//!
//! The watcher needs exactly two questions answered: the current tip
//! height, and the confirmation height of a transaction (if any).
//! [`EsploraChainClient`] answers them over an Esplora-style HTTP API;
//! [`MockChain`] answers them from memory for tests and the simnet.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors from a chain backend.
#[derive(Debug)]
pub enum ChainError {
    /// The backend is unreachable.
    Transport(String),
    /// The backend returned something unparseable.
    BadResponse(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(detail) => write!(f, "chain backend unreachable: {detail}"),
            Self::BadResponse(detail) => write!(f, "bad chain response: {detail}"),
        }
    }
}

impl std::error::Error for ChainError {}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Read access to the base chain.
pub trait ChainClient: Send + Sync {
    /// Current best block height.
    fn tip_height(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// The height a transaction confirmed at, or `None` while
    /// unconfirmed (or dropped by a reorg).
    fn tx_confirmation_height(
        &self,
        txid: &[u8; 32],
    ) -> impl Future<Output = Result<Option<u64>, ChainError>> + Send;
}

impl<T: ChainClient> ChainClient for std::sync::Arc<T> {
    async fn tip_height(&self) -> Result<u64, ChainError> {
        (**self).tip_height().await
    }

    async fn tx_confirmation_height(&self, txid: &[u8; 32]) -> Result<Option<u64>, ChainError> {
        (**self).tx_confirmation_height(txid).await
    }
}

// ---------------------------------------------------------------------------
// Esplora-backed client
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

/// Chain client speaking the Esplora REST API
/// (`/blocks/tip/height`, `/tx/:txid/status`).
pub struct EsploraChainClient {
    base_url: String,
    http: reqwest::Client,
}

impl EsploraChainClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

impl ChainClient for EsploraChainClient {
    async fn tip_height(&self) -> Result<u64, ChainError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let body = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?
            .text()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        body.trim()
            .parse()
            .map_err(|_| ChainError::BadResponse(format!("tip height: {body}")))
    }

    async fn tx_confirmation_height(&self, txid: &[u8; 32]) -> Result<Option<u64>, ChainError> {
        let mut hex = String::with_capacity(64);
        for b in txid {
            hex.push_str(&format!("{b:02x}"));
        }
        let url = format!("{}/tx/{}/status", self.base_url, hex);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status: TxStatus = response
            .json()
            .await
            .map_err(|e| ChainError::BadResponse(e.to_string()))?;
        Ok(status.confirmed.then_some(status.block_height).flatten())
    }
}

// ---------------------------------------------------------------------------
// Mock chain
// ---------------------------------------------------------------------------

/// In-memory chain for tests and the simnet: mine blocks, confirm
/// transactions, and drop them again to simulate reorgs.
#[derive(Default)]
pub struct MockChain {
    tip: AtomicU64,
    confirmed: RwLock<HashMap<[u8; 32], u64>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the tip by `blocks`.
    pub fn mine(&self, blocks: u64) {
        self.tip.fetch_add(blocks, Ordering::SeqCst);
    }

    /// Confirm a transaction at the next block and return its height.
    pub fn confirm_tx(&self, txid: [u8; 32]) -> u64 {
        let height = self.tip.fetch_add(1, Ordering::SeqCst) + 1;
        self.confirmed
            .write()
            .expect("mock chain lock poisoned")
            .insert(txid, height);
        height
    }

    /// Drop a transaction from the chain, as a reorg would.
    pub fn reorg_out(&self, txid: &[u8; 32]) {
        self.confirmed
            .write()
            .expect("mock chain lock poisoned")
            .remove(txid);
    }

    pub fn tip(&self) -> u64 {
        self.tip.load(Ordering::SeqCst)
    }
}

impl ChainClient for MockChain {
    async fn tip_height(&self) -> Result<u64, ChainError> {
        Ok(self.tip())
    }

    async fn tx_confirmation_height(&self, txid: &[u8; 32]) -> Result<Option<u64>, ChainError> {
        Ok(self
            .confirmed
            .read()
            .expect("mock chain lock poisoned")
            .get(txid)
            .copied())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_chain_confirms_and_reorgs() {
        let chain = MockChain::new();
        chain.mine(10);
        assert_eq!(chain.tip_height().await.unwrap(), 10);

        let txid = [0xAB; 32];
        assert_eq!(chain.tx_confirmation_height(&txid).await.unwrap(), None);

        let height = chain.confirm_tx(txid);
        assert_eq!(height, 11);
        assert_eq!(chain.tx_confirmation_height(&txid).await.unwrap(), Some(11));

        chain.mine(5);
        assert_eq!(chain.tip_height().await.unwrap(), 16);

        chain.reorg_out(&txid);
        assert_eq!(chain.tx_confirmation_height(&txid).await.unwrap(), None);
    }
}

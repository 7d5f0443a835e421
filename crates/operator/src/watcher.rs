//! The chain watcher.
//!
//! A background task per operator that polls the base chain and:
//!
//! - opens the cooperative-exit gate once an exit transaction reaches
//!   the confirmation threshold (flipping the transfer from
//!   `SENDER_KEY_TWEAK_PENDING` to `SENDER_KEY_TWEAKED` when the sender
//!   has already tweaked),
//! - reverts the gate when a reorg drops the transaction back below the
//!   threshold, and
//! - sweeps expired pre-tweak transfers.
//!
//! The watcher is the single writer of exit confirmation state; handlers
//! only read it. Poll interval and threshold come from configuration and
//! may be overridden at runtime via knobs.

use std::time::Duration;

use config::constants::{CHAIN_WATCHER_POLL_INTERVAL_MS, COOP_EXIT_CONFIRMATION_THRESHOLD};
use config::knobs::knob;
use storage::journal::JournalEvent;
use storage::transfer::TransferStatus;

use crate::chain::ChainClient;
use crate::error::OperatorError;
use crate::{now_unix, OperatorNode};

/// Chain watcher task for one operator.
pub struct ChainWatcher<H> {
    node: OperatorNode,
    chain: H,
}

impl<H: ChainClient> ChainWatcher<H> {
    pub fn new(node: OperatorNode, chain: H) -> Self {
        Self { node, chain }
    }

    /// Poll until the node's cancellation token fires.
    pub async fn run(self) {
        let interval_ms = self.node.knobs().value(
            knob::CHAIN_WATCHER_POLL_INTERVAL_MS,
            CHAIN_WATCHER_POLL_INTERVAL_MS as f64,
        ) as u64;
        let cancel = self.node.cancel_token().clone();
        tracing::info!(operator = self.node.id(), interval_ms, "chain watcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
            }
            if let Err(e) = self.tick().await {
                tracing::warn!(operator = self.node.id(), %e, "chain watcher tick failed");
            }
        }
        tracing::info!(operator = self.node.id(), "chain watcher stopped");
    }

    /// One poll cycle: expiry sweep plus exit confirmation tracking.
    /// Exposed for deterministic tests.
    pub async fn tick(&self) -> Result<(), OperatorError> {
        let expired = self.node.expire_transfers(now_unix())?;
        if expired > 0 {
            tracing::info!(operator = self.node.id(), expired, "expired transfers swept");
        }

        let exits = self.node.stores().transfers.watched_exits()?;
        if exits.is_empty() {
            return Ok(());
        }

        let tip = self
            .chain
            .tip_height()
            .await
            .map_err(|_| OperatorError::Aborted("chain backend unreachable"))?;
        let threshold = self.node.knobs().value(
            knob::COOP_EXIT_CONFIRMATION_THRESHOLD,
            COOP_EXIT_CONFIRMATION_THRESHOLD as f64,
        ) as u64;

        for exit in exits {
            let height = self
                .chain
                .tx_confirmation_height(&exit.exit_txid)
                .await
                .map_err(|_| OperatorError::Aborted("chain backend unreachable"))?;
            let confirmations = match height {
                Some(h) if tip >= h => tip - h + 1,
                _ => 0,
            };

            if !exit.chain_confirmed && confirmations >= threshold {
                self.node
                    .stores()
                    .transfers
                    .set_exit_confirmation(&exit.exit_id, height, true)?;
                self.node.journal(
                    &exit.transfer_id,
                    JournalEvent::ChainConfirmed {
                        height: height.unwrap_or_default(),
                    },
                );
                tracing::info!(
                    operator = self.node.id(),
                    transfer_id = %exit.transfer_id,
                    confirmations,
                    "cooperative exit confirmed"
                );

                // Open the tweak gate if the sender already tweaked.
                let transfer = self.node.stores().transfers.get(&exit.transfer_id)?;
                if transfer.status == TransferStatus::SenderKeyTweakPending
                    && transfer.sender_tweaked()
                {
                    self.node.stores().transfers.compare_and_swap_status(
                        &exit.transfer_id,
                        &[TransferStatus::SenderKeyTweakPending],
                        TransferStatus::SenderKeyTweaked,
                    )?;
                }
            } else if exit.chain_confirmed && confirmations < threshold {
                // Reorg below the threshold: close the gate again, unless
                // the receiver already rotated keys (the claim passed its
                // gate legitimately and cannot be unwound).
                self.node
                    .stores()
                    .transfers
                    .set_exit_confirmation(&exit.exit_id, height, false)?;
                self.node.journal(&exit.transfer_id, JournalEvent::ChainReorged);
                tracing::warn!(
                    operator = self.node.id(),
                    transfer_id = %exit.transfer_id,
                    confirmations,
                    "cooperative exit reorged below threshold"
                );

                let transfer = self.node.stores().transfers.get(&exit.transfer_id)?;
                if transfer.status == TransferStatus::SenderKeyTweaked {
                    self.node.stores().transfers.compare_and_swap_status(
                        &exit.transfer_id,
                        &[TransferStatus::SenderKeyTweaked],
                        TransferStatus::SenderKeyTweakPending,
                    )?;
                }
            }
        }
        Ok(())
    }
}

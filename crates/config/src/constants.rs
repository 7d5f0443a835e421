//! Spark protocol constants.
//!
//! Timelock parameters, sequence-number layout, confirmation thresholds and
//! default timeouts shared by every operator in a federation. All values are
//! operator-agreed protocol parameters; changing them unilaterally forks the
//! federation.

use crate::Network;

/// Initial relative timelock for new leaves (in blocks).
pub const INITIAL_TIMELOCK: u16 = 2000;

/// Timelock decrement applied to each successor refund transaction.
///
/// Every transfer re-signs the refund with `sequence - TIMELOCK_INTERVAL`;
/// a leaf whose remaining timelock is at or below this interval must be
/// refreshed through split/consolidation before it can transfer again.
pub const TIMELOCK_INTERVAL: u16 = 100;

/// Offset subtracted from direct (non-CPFP) refund timelocks.
pub const DIRECT_TIMELOCK_OFFSET: u16 = 50;

/// Sequence flag (bit 30) marking Spark protocol transactions.
pub const SPARK_SEQUENCE_FLAG: u32 = 1 << 30;

/// Mask extracting the block-based timelock from a sequence number.
pub const TIMELOCK_MASK: u32 = 0x0000_FFFF;

/// Base-chain confirmations required before a cooperative exit's key-tweak
/// gate opens. Overridable at runtime via the
/// [`knob::COOP_EXIT_CONFIRMATION_THRESHOLD`](crate::knobs::knob) knob.
pub const COOP_EXIT_CONFIRMATION_THRESHOLD: u64 = 6;

/// Fee subtracted from direct-variant refund outputs, in satoshis.
///
/// Direct refunds have no anchor output for CPFP fee bumping, so the relay
/// fee is embedded: 191 estimated vbytes at 5 sat/vbyte.
pub const DEFAULT_FEE_SATS: u64 = 955;

/// Statement timeout for store row locks, in milliseconds.
pub const DATABASE_STATEMENT_TIMEOUT_MS: u64 = 60_000;

/// Per-operator timeout for internal fan-out RPCs, in milliseconds.
pub const INTERNAL_RPC_TIMEOUT_MS: u64 = 30_000;

/// Chain watcher poll interval, in milliseconds.
pub const CHAIN_WATCHER_POLL_INTERVAL_MS: u64 = 5_000;

/// Confirmations required before a deposit is considered final.
pub const fn deposit_confirmation_threshold(network: Network) -> u64 {
    match network {
        Network::Mainnet => 3,
        Network::Regtest => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timelock_interval_divides_initial() {
        // A fresh leaf supports exactly 20 transfer generations.
        assert_eq!(INITIAL_TIMELOCK % TIMELOCK_INTERVAL, 0);
        assert_eq!(INITIAL_TIMELOCK / TIMELOCK_INTERVAL, 20);
    }

    #[test]
    fn sequence_flag_is_bit_30() {
        assert_eq!(SPARK_SEQUENCE_FLAG, 0x4000_0000);
        assert_eq!(SPARK_SEQUENCE_FLAG & TIMELOCK_MASK, 0);
    }

    #[test]
    fn regtest_deposits_confirm_faster() {
        assert!(
            deposit_confirmation_threshold(Network::Regtest)
                < deposit_confirmation_threshold(Network::Mainnet)
        );
    }
}

//! Signing-operator federation configuration.
//!
//! This crate provides the static, per-process configuration for a Spark
//! signing operator:
//!
//! - [`FederationConfig`] -- the operator set and FROST threshold shared by
//!   every operator in the federation
//! - [`OperatorInfo`] -- identity of a single signing operator
//! - [`constants`] -- protocol-level parameters (timelocks, sequence flags,
//!   confirmation thresholds, timeouts)
//! - [`knobs`] -- runtime-tunable float knobs keyed by `name[@target]`
//!
//! `config` has no dependencies beyond std, so it can be used freely as a
//! leaf dependency by every other crate in the workspace.

pub mod constants;
pub mod knobs;

pub use knobs::Knobs;

use std::fmt;

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// The Bitcoin network a leaf or transfer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Mainnet,
    Regtest,
}

impl Network {
    /// Proto enum value used on the wire.
    pub const fn to_proto(self) -> i32 {
        match self {
            Self::Mainnet => 1,
            Self::Regtest => 2,
        }
    }

    /// Parse the proto enum value. Returns `None` for unknown values.
    pub const fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Mainnet),
            2 => Some(Self::Regtest),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Regtest => write!(f, "regtest"),
        }
    }
}

// ---------------------------------------------------------------------------
// OperatorInfo
// ---------------------------------------------------------------------------

/// Identity of a single signing operator in the federation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorInfo {
    /// Stable identifier used as a map key on the wire (e.g. `"0"`).
    pub id: String,

    /// Zero-based position in the federation. The FROST identifier for
    /// this operator is `index + 1` (identifier zero is invalid).
    pub index: u16,

    /// gRPC endpoint for internal fan-out (e.g. `https://so-1.example.com`).
    pub address: String,

    /// Hex-encoded compressed identity public key.
    pub identity_public_key: String,
}

// ---------------------------------------------------------------------------
// FederationConfig
// ---------------------------------------------------------------------------

/// Configuration shared by every operator in a federation.
///
/// Any operator can act as coordinator for a given transfer; the client
/// picks which one it talks to. The operator slice is ordered by
/// [`OperatorInfo::index`], which doubles as the FROST identifier basis.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// The network this federation serves.
    pub network: Network,

    /// All signing operators, ordered by [`OperatorInfo::index`].
    operators: Vec<OperatorInfo>,

    /// FROST signing threshold (t of n).
    pub min_signers: usize,
}

impl FederationConfig {
    /// Build a federation config. Operators must be ordered by index.
    pub fn new(network: Network, operators: Vec<OperatorInfo>, min_signers: usize) -> Self {
        debug_assert!(min_signers >= 1 && min_signers <= operators.len());
        debug_assert!(
            operators
                .iter()
                .enumerate()
                .all(|(i, o)| o.index as usize == i)
        );
        Self {
            network,
            operators,
            min_signers,
        }
    }

    /// All operators, ordered by index.
    pub fn operators(&self) -> &[OperatorInfo] {
        &self.operators
    }

    /// Number of operators in the federation.
    pub fn num_operators(&self) -> usize {
        self.operators.len()
    }

    /// Look up an operator by its stable identifier.
    pub fn operator_by_id(&self, id: &str) -> Option<&OperatorInfo> {
        self.operators.iter().find(|o| o.id == id)
    }

    /// Look up an operator by index. O(1).
    pub fn operator_by_index(&self, index: u16) -> Option<&OperatorInfo> {
        self.operators.get(index as usize)
    }

    /// Build a regtest federation of `n` local operators for tests and the
    /// simnet binary.
    pub fn local_regtest(n: usize, min_signers: usize) -> Self {
        let operators = (0..n)
            .map(|i| OperatorInfo {
                id: i.to_string(),
                index: i as u16,
                address: format!("http://127.0.0.1:{}", 8535 + i),
                identity_public_key: String::new(),
            })
            .collect();
        Self::new(Network::Regtest, operators, min_signers)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_regtest_federation() {
        let config = FederationConfig::local_regtest(5, 3);
        assert_eq!(config.num_operators(), 5);
        assert_eq!(config.min_signers, 3);
        assert_eq!(config.operator_by_id("2").unwrap().index, 2);
        assert_eq!(config.operator_by_index(4).unwrap().id, "4");
        assert!(config.operator_by_index(5).is_none());
    }

    #[test]
    fn network_proto_roundtrip() {
        for network in [Network::Mainnet, Network::Regtest] {
            assert_eq!(Network::from_proto(network.to_proto()), Some(network));
        }
        assert_eq!(Network::from_proto(0), None);
    }

    #[test]
    fn operator_ids_are_stable_map_keys() {
        let config = FederationConfig::local_regtest(3, 2);
        let ids: Vec<&str> = config.operators().iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["0", "1", "2"]);
    }
}

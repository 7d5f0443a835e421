//! Persistent state for a Spark signing operator.
//!
//! Storage access is expressed through domain-specific repository traits
//! with typed, meaningful methods -- there is no generic key-value trait.
//! Each trait lives next to the rows it owns:
//!
//! - [`leaf::LeafStore`] -- tree nodes and their row-level status locks
//! - [`keyshare::KeyshareRegistry`] -- this operator's FROST key shares
//! - [`nonce::SigningNoncePool`] -- pre-committed signing nonces,
//!   consumed exactly once
//! - [`transfer::TransferStore`] -- transfer rows, claim locks, and
//!   cooperative-exit bookkeeping
//! - [`journal::TransferJournal`] -- LMDB-backed hash-chained event journal
//!
//! The in-memory implementations provide the same serialization guarantees
//! a SQL backend would give via `SELECT ... FOR UPDATE`: status-gated
//! row locks that fail fast instead of blocking, and closure-scoped row
//! mutation that is atomic with respect to other accessors.

mod error;

pub mod journal;
pub mod keyshare;
pub mod leaf;
pub mod nonce;
pub mod transfer;

pub use error::StorageError;

//! Cryptographic primitives for the Spark operator core.
//!
//! Three concerns live here, each in its own module:
//!
//! - [`frost`] -- the two-round FROST ceremony as seen by a signing
//!   operator: nonce-pair generation, partial signatures over Taproot
//!   sighashes, and aggregation with the user participant in a nested
//!   signing group.
//! - [`secp`] -- additive secp256k1 key arithmetic used when applying
//!   key-share tweaks.
//! - [`vss`] -- verifiable secret sharing. Operators never *split* secrets
//!   in production (users do, to distribute tweaks); operators validate the
//!   share they receive against its proof vector. Splitting and recovery
//!   are provided for the user role in tests and simulations.
//!
//! Secret material handled by this crate never crosses an operator
//! boundary; only nonce commitments, proofs, and signature shares do.

pub mod frost;
pub mod secp;
pub mod vss;

//! Transport layer for the Spark operator federation.
//!
//! Three things live here:
//!
//! - [`spark`] -- wire messages for the user-facing service (transfer
//!   initiation, key tweaks, queries, claim, cancel)
//! - [`internal`] -- wire messages for the operator-to-operator fan-out
//!   mirror (`Initiate*`, `Rollback*`, tweak application, the FROST
//!   commit/sign rounds, claim settlement)
//! - [`rpc`] -- the [`rpc::FollowerClient`] trait the coordinator
//!   orchestrator fans out through, [`rpc::RpcError`], and the tonic
//!   client in [`grpc`]
//!
//! Message structs are hand-maintained prost derives rather than build-time
//! generated code; the set is small and stable, and checking it in keeps
//! the build free of a protoc dependency. Server-side gRPC framing is a
//! deployment concern outside this workspace -- the core consumes
//! transports only through [`rpc::FollowerClient`].

pub mod grpc;
pub mod internal;
pub mod rpc;
pub mod spark;

pub use rpc::{FollowerClient, RpcError};

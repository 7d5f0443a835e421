//! In-process federation.
//!
//! [`LocalCluster`] wires `n` [`OperatorNode`]s together through a
//! [`LocalFollowerClient`] that dispatches internal RPCs as direct
//! handler calls. The integration tests and the simnet binary run whole
//! multi-operator scenarios this way, including fault injection for the
//! ceremony retry paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use config::FederationConfig;
use transport::internal;
use transport::rpc::{FollowerClient, RpcError};

use crate::coordinator::Coordinator;
use crate::error::OperatorError;
use crate::{OperatorNode, Stores};

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// One-shot faults for exercising ceremony retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail the next commit round on this operator.
    FailNextCommit,
    /// Fail the next sign round on this operator.
    FailNextSign,
}

// ---------------------------------------------------------------------------
// LocalFollowerClient
// ---------------------------------------------------------------------------

/// [`FollowerClient`] that calls handlers on in-process nodes.
pub struct LocalFollowerClient {
    nodes: HashMap<String, OperatorNode>,
    faults: Mutex<HashMap<String, Fault>>,
}

impl LocalFollowerClient {
    pub fn new(nodes: &[OperatorNode]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|n| (n.id().to_owned(), n.clone()))
                .collect(),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Arm a one-shot fault on an operator.
    pub fn inject_fault(&self, operator_id: &str, fault: Fault) {
        self.faults
            .lock()
            .expect("fault lock poisoned")
            .insert(operator_id.to_owned(), fault);
    }

    fn take_fault(&self, operator_id: &str, expected: Fault) -> bool {
        let mut faults = self.faults.lock().expect("fault lock poisoned");
        if faults.get(operator_id) == Some(&expected) {
            faults.remove(operator_id);
            true
        } else {
            false
        }
    }

    fn node(&self, operator_id: &str) -> Result<&OperatorNode, RpcError> {
        self.nodes
            .get(operator_id)
            .ok_or_else(|| RpcError::UnknownOperator(operator_id.to_owned()))
    }
}

fn to_rpc_error(err: OperatorError) -> RpcError {
    RpcError::Status {
        code: err.code(),
        message: err.to_string(),
    }
}

fn unavailable() -> RpcError {
    RpcError::Status {
        code: tonic::Code::Unavailable,
        message: "injected fault".into(),
    }
}

impl FollowerClient for LocalFollowerClient {
    async fn initiate_transfer(
        &self,
        operator_id: &str,
        request: internal::InitiateTransferInternal,
    ) -> Result<(), RpcError> {
        self.node(operator_id)?
            .handle_initiate_transfer(request)
            .map_err(to_rpc_error)
    }

    async fn initiate_cooperative_exit(
        &self,
        operator_id: &str,
        request: internal::InitiateCooperativeExitInternal,
    ) -> Result<(), RpcError> {
        self.node(operator_id)?
            .handle_initiate_cooperative_exit(request)
            .map_err(to_rpc_error)
    }

    async fn rollback_transfer(
        &self,
        operator_id: &str,
        request: internal::RollbackTransferInternal,
    ) -> Result<(), RpcError> {
        self.node(operator_id)?
            .handle_rollback_transfer(request)
            .map_err(to_rpc_error)
    }

    async fn apply_tweaks(
        &self,
        operator_id: &str,
        request: internal::ApplyTweaksInternal,
    ) -> Result<(), RpcError> {
        self.node(operator_id)?
            .handle_apply_tweaks(request)
            .map_err(to_rpc_error)
    }

    async fn settle_claim(
        &self,
        operator_id: &str,
        request: internal::SettleClaimInternal,
    ) -> Result<(), RpcError> {
        self.node(operator_id)?
            .handle_settle_claim(request)
            .map_err(to_rpc_error)
    }

    async fn frost_commit(
        &self,
        operator_id: &str,
        request: internal::FrostCommitRequest,
    ) -> Result<internal::FrostCommitResponse, RpcError> {
        if self.take_fault(operator_id, Fault::FailNextCommit) {
            return Err(unavailable());
        }
        self.node(operator_id)?
            .handle_frost_commit(request)
            .map_err(to_rpc_error)
    }

    async fn frost_sign(
        &self,
        operator_id: &str,
        request: internal::FrostSignRequest,
    ) -> Result<internal::FrostSignResponse, RpcError> {
        if self.take_fault(operator_id, Fault::FailNextSign) {
            return Err(unavailable());
        }
        self.node(operator_id)?
            .handle_frost_sign(request)
            .map_err(to_rpc_error)
    }
}

// ---------------------------------------------------------------------------
// LocalCluster
// ---------------------------------------------------------------------------

/// A whole federation in one process.
pub struct LocalCluster {
    pub nodes: Vec<OperatorNode>,
    pub client: Arc<LocalFollowerClient>,
}

impl LocalCluster {
    /// Build an `n`-operator regtest federation with threshold
    /// `min_signers`, each node on fresh in-memory stores.
    pub fn new(n: usize, min_signers: usize) -> Self {
        let config = FederationConfig::local_regtest(n, min_signers);
        let nodes: Vec<OperatorNode> = (0..n)
            .map(|i| OperatorNode::new(config.clone(), i as u16, Stores::in_memory()))
            .collect();
        let client = Arc::new(LocalFollowerClient::new(&nodes));
        Self { nodes, client }
    }

    /// A coordinator handle running on the given operator.
    pub fn coordinator(&self, index: usize) -> Coordinator<LocalFollowerClient> {
        Coordinator::new(self.nodes[index].clone(), Arc::clone(&self.client))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cluster_dispatches_to_the_right_node() {
        let cluster = LocalCluster::new(3, 2);
        assert_eq!(cluster.nodes.len(), 3);
        assert_eq!(cluster.nodes[1].id(), "1");

        // Unknown operators are rejected at the client.
        let result = cluster
            .client
            .rollback_transfer(
                "9",
                internal::RollbackTransferInternal {
                    transfer_id: "none".into(),
                    expired: false,
                },
            )
            .await;
        assert!(matches!(result, Err(RpcError::UnknownOperator(_))));

        // Rollback of an unknown transfer on a real node is idempotent.
        cluster
            .client
            .rollback_transfer(
                "1",
                internal::RollbackTransferInternal {
                    transfer_id: "none".into(),
                    expired: false,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let cluster = LocalCluster::new(3, 2);
        cluster.client.inject_fault("1", Fault::FailNextCommit);

        let request = internal::FrostCommitRequest { jobs: Vec::new() };
        let first = cluster.client.frost_commit("1", request.clone()).await;
        assert!(first.is_err());

        let second = cluster.client.frost_commit("1", request).await;
        assert!(second.is_ok());
    }
}

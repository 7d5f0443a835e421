//! The coordinator orchestrator.
//!
//! Any operator can coordinate a transfer; the client picks one. The
//! coordinator validates and applies every step locally first (it is a
//! follower too), then fans the internal mirror out to the rest of the
//! federation in parallel. A multi-operator write either reaches every
//! follower or is compensated with a rollback fan-out before the call
//! returns; steps that cannot be compensated (tweak application) are
//! instead idempotent so a retry converges.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;

use storage::journal::JournalEvent;
use storage::transfer::{TransferStatus, TransferType};
use transport::internal;
use transport::rpc::{FollowerClient, RpcError};
use transport::spark;

use crate::bitcoin_tx::refund_sighash;
use crate::convert::{decode_signing_results, encode_signing_results, transfer_to_proto};
use crate::error::OperatorError;
use crate::signing::{commitment_from_proto, RefundVariant, SignedJobResult, SigningJobSpec};
use crate::{generate_uuid, pubkey33, OperatorNode};

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// The orchestrator role for one operator, generic over the fan-out
/// transport.
pub struct Coordinator<C> {
    pub(crate) node: OperatorNode,
    pub(crate) client: Arc<C>,
}

impl<C> Coordinator<C> {
    pub fn new(node: OperatorNode, client: Arc<C>) -> Self {
        Self { node, client }
    }

    /// The operator this coordinator runs on.
    pub fn node(&self) -> &OperatorNode {
        &self.node
    }
}

// ---------------------------------------------------------------------------
// Fan-out helpers
// ---------------------------------------------------------------------------

/// Pick the caller-visible error for a set of follower failures:
/// transient failures surface as `Aborted`, anything else keeps its kind.
fn worst_follower_error(failures: Vec<(u16, RpcError)>) -> OperatorError {
    let mut worst = OperatorError::Aborted("operator partial failure; retry");
    for (_, failure) in failures {
        if !failure.is_transient() {
            worst = failure.into();
        }
    }
    worst
}

impl<C: FollowerClient + 'static> Coordinator<C> {
    /// Fan one request builder out to every *other* operator in parallel,
    /// collecting failures by index.
    async fn fan_out<F, Fut>(&self, call: F) -> Vec<(u16, RpcError)>
    where
        F: Fn(Arc<C>, String) -> Fut,
        Fut: std::future::Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let self_index = self.node.self_index();
        let mut set = JoinSet::new();
        for op in self.node.config().operators() {
            if op.index == self_index {
                continue;
            }
            let fut = call(Arc::clone(&self.client), op.id.clone());
            let index = op.index;
            set.spawn(async move { (index, fut.await) });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(()))) => {
                    let _ = index;
                }
                Ok((index, Err(e))) => failures.push((index, e)),
                Err(_) => failures.push((
                    u16::MAX,
                    RpcError::Status {
                        code: tonic::Code::Internal,
                        message: "fan-out task failed".into(),
                    },
                )),
            }
        }
        failures
    }

    /// Best-effort rollback fan-out; failures are logged, not surfaced
    /// (the rollback handler is idempotent and expiry sweeps converge).
    async fn fan_rollback(&self, transfer_id: &str, expired: bool) {
        let request = internal::RollbackTransferInternal {
            transfer_id: transfer_id.to_owned(),
            expired,
        };
        let failures = self
            .fan_out(move |client, op_id| {
                let request = request.clone();
                async move { client.rollback_transfer(&op_id, request).await }
            })
            .await;
        for (index, failure) in failures {
            tracing::warn!(transfer_id, operator_index = index, %failure, "rollback fan-out failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Signing commitments (user pre-signing support)
// ---------------------------------------------------------------------------

impl<C: FollowerClient + 'static> Coordinator<C> {
    /// Reserve operator nonce commitments for upcoming signing jobs.
    ///
    /// Layout is variant-major: `count = 3` with `node_ids = [A, B]`
    /// yields `[A0, B0, A1, B1, A2, B2]`. The reserved nonces stay in
    /// each member's pool until the matching sign round consumes them.
    pub async fn get_signing_commitments(
        &self,
        request: spark::GetSigningCommitmentsRequest,
    ) -> Result<spark::GetSigningCommitmentsResponse, OperatorError> {
        if request.node_ids.is_empty() || request.count == 0 {
            return Err(OperatorError::InvalidArgument("nothing to reserve"));
        }

        // One commit job per (count, node) entry.
        let mut jobs = Vec::with_capacity(request.node_ids.len() * request.count as usize);
        for _ in 0..request.count {
            for node_id in &request.node_ids {
                let leaf = self
                    .node
                    .stores()
                    .leaves
                    .get(node_id)
                    .map_err(|_| OperatorError::NotFound("unknown leaf"))?;
                jobs.push(internal::FrostCommitJob {
                    job_id: generate_uuid(),
                    keyshare_id: leaf.keyshare_id,
                });
            }
        }
        let commit_request = internal::FrostCommitRequest { jobs: jobs.clone() };

        // Signing set: self plus the lowest indices up to the threshold.
        let config = self.node.config();
        let self_index = self.node.self_index();
        let mut members = vec![self_index];
        for op in config.operators() {
            if members.len() >= config.min_signers {
                break;
            }
            if op.index != self_index {
                members.push(op.index);
            }
        }

        let mut responses: BTreeMap<u16, internal::FrostCommitResponse> = BTreeMap::new();
        responses.insert(self_index, self.node.handle_frost_commit(commit_request.clone())?);

        let mut set = JoinSet::new();
        for index in &members {
            if *index == self_index {
                continue;
            }
            let op = config
                .operator_by_index(*index)
                .ok_or(OperatorError::Internal("bad member index"))?;
            let client = Arc::clone(&self.client);
            let op_id = op.id.clone();
            let request = commit_request.clone();
            let idx = *index;
            set.spawn(async move { (idx, client.frost_commit(&op_id, request).await) });
        }
        while let Some(joined) = set.join_next().await {
            let (index, result) = joined.map_err(|_| OperatorError::Internal("join failed"))?;
            let response = result.map_err(OperatorError::from)?;
            responses.insert(index, response);
        }

        let mut entries = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let mut signing_nonce_commitments = std::collections::HashMap::new();
            for (index, response) in &responses {
                let op = config
                    .operator_by_index(*index)
                    .ok_or(OperatorError::Internal("bad member index"))?;
                let commitment = response
                    .commitments
                    .iter()
                    .find(|c| c.job_id == job.job_id)
                    .and_then(|c| c.commitment.clone())
                    .ok_or(OperatorError::Internal("member omitted a commitment"))?;
                signing_nonce_commitments.insert(op.id.clone(), commitment);
            }
            entries.push(spark::RequestedCommitments {
                signing_nonce_commitments,
            });
        }
        Ok(spark::GetSigningCommitmentsResponse {
            signing_commitments: entries,
        })
    }
}

// ---------------------------------------------------------------------------
// Transfer initiation
// ---------------------------------------------------------------------------

impl<C: FollowerClient + 'static> Coordinator<C> {
    /// Start a transfer: lock leaves on every operator, co-sign the new
    /// refund transactions, and move the transfer to
    /// `SENDER_KEY_TWEAK_PENDING`.
    pub async fn start_transfer(
        &self,
        request: spark::InitiateTransferRequest,
    ) -> Result<spark::InitiateTransferResponse, OperatorError> {
        let (transfer, signing_results) = self.initiate(request, None).await?;
        Ok(spark::InitiateTransferResponse {
            transfer: Some(transfer),
            signing_results,
        })
    }

    /// Start a cooperative exit: a transfer whose key-tweak gate opens
    /// only once the exit transaction confirms on the base chain.
    pub async fn cooperative_exit(
        &self,
        request: spark::CooperativeExitRequest,
    ) -> Result<spark::CooperativeExitResponse, OperatorError> {
        let transfer_request = request
            .transfer
            .ok_or(OperatorError::InvalidArgument("missing transfer"))?;
        if transfer_request.transfer_type != TransferType::CooperativeExit.to_proto() {
            return Err(OperatorError::InvalidArgument("cooperative exit requires the exit type"));
        }
        if request.exit_id.is_empty() {
            return Err(OperatorError::InvalidArgument("missing exit id"));
        }
        let exit_txid: [u8; 32] = request
            .exit_txid
            .as_ref()
            .try_into()
            .map_err(|_| OperatorError::InvalidArgument("exit txid must be 32 bytes"))?;

        let (transfer, signing_results) = self
            .initiate(transfer_request, Some((request.exit_id, exit_txid)))
            .await?;
        Ok(spark::CooperativeExitResponse {
            transfer: Some(transfer),
            signing_results,
        })
    }

    async fn initiate(
        &self,
        request: spark::InitiateTransferRequest,
        exit: Option<(String, [u8; 32])>,
    ) -> Result<(spark::TransferProto, Vec<spark::LeafSigningResult>), OperatorError> {
        if request.transfer_id.is_empty() {
            return Err(OperatorError::InvalidArgument("missing transfer id"));
        }
        if request.leaves.is_empty() {
            return Err(OperatorError::InvalidArgument("transfer must include at least one leaf"));
        }
        let sender = pubkey33(&request.sender_identity_pubkey, "sender identity key")?;
        let transfer_id = request.transfer_id.clone();

        // Idempotent re-issue: return the recorded state instead of
        // re-executing (and re-consuming nonces).
        if let Ok(existing) = self.node.stores().transfers.get(&transfer_id) {
            if existing.sender_identity != sender {
                return Err(OperatorError::Conflict("transfer id already in use"));
            }
            if existing.status != TransferStatus::SenderInitiated {
                let results = existing
                    .signing_results_blob
                    .as_deref()
                    .map(decode_signing_results)
                    .unwrap_or_default();
                let proto = transfer_to_proto(&existing, self.node.stores().leaves.as_ref());
                return Ok((proto, results));
            }
            // SenderInitiated: signing did not finish; fall through and
            // re-run it with the (fresh) material in this request.
        } else {
            let internal_request = build_internal_initiate(&request);

            // Local lock-and-persist first; the coordinator is follower
            // zero for its own transfers.
            match &exit {
                Some((exit_id, exit_txid)) => {
                    self.node.handle_initiate_cooperative_exit(
                        internal::InitiateCooperativeExitInternal {
                            transfer: Some(internal_request.clone()),
                            exit_id: exit_id.clone(),
                            exit_txid: Bytes::copy_from_slice(exit_txid),
                        },
                    )?;
                }
                None => self.node.handle_initiate_transfer(internal_request.clone())?,
            }

            // Consensus: every operator must acknowledge the lock.
            let failures = match &exit {
                Some((exit_id, exit_txid)) => {
                    let fan_request = internal::InitiateCooperativeExitInternal {
                        transfer: Some(internal_request.clone()),
                        exit_id: exit_id.clone(),
                        exit_txid: Bytes::copy_from_slice(exit_txid),
                    };
                    self.fan_out(move |client, op_id| {
                        let request = fan_request.clone();
                        async move { client.initiate_cooperative_exit(&op_id, request).await }
                    })
                    .await
                }
                None => {
                    let fan_request = internal_request.clone();
                    self.fan_out(move |client, op_id| {
                        let request = fan_request.clone();
                        async move { client.initiate_transfer(&op_id, request).await }
                    })
                    .await
                }
            };
            if !failures.is_empty() {
                tracing::warn!(
                    transfer_id = %transfer_id,
                    failures = failures.len(),
                    "initiation fan-out failed; rolling back"
                );
                self.fan_rollback(&transfer_id, false).await;
                let _ = self.node.handle_rollback_transfer(internal::RollbackTransferInternal {
                    transfer_id: transfer_id.clone(),
                    expired: false,
                });
                return Err(worst_follower_error(failures));
            }
        }

        // Sign the new refund transactions.
        let specs = self.build_signing_specs(&request)?;
        let results = self.run_signing_ceremony(&specs).await?;
        let leaf_results = assemble_leaf_results(&request, &results, self.node.config());

        let blob = encode_signing_results(&leaf_results);
        let final_cpfp: Vec<(String, Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>)> = results
            .iter()
            .filter(|r| r.final_signature.is_some())
            .fold(BTreeMap::new(), |mut acc: BTreeMap<String, (Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>)>, r| {
                let entry = acc.entry(r.leaf_id.clone()).or_default();
                match r.variant {
                    RefundVariant::Cpfp => entry.0 = r.final_signature.clone(),
                    RefundVariant::Direct => entry.1 = r.final_signature.clone(),
                    RefundVariant::DirectFromCpfp => entry.2 = r.final_signature.clone(),
                }
                acc
            })
            .into_iter()
            .map(|(leaf_id, (cpfp, direct, dfc))| (leaf_id, cpfp, direct, dfc))
            .collect();

        self.node.stores().transfers.update(&transfer_id, &mut |row| {
            row.signing_results_blob = Some(blob.clone());
            for (leaf_id, cpfp, direct, dfc) in &final_cpfp {
                if let Some(leaf) = row.leaves.iter_mut().find(|l| &l.leaf_id == leaf_id) {
                    leaf.cpfp_refund_signature = cpfp.clone();
                    leaf.direct_refund_signature = direct.clone();
                    leaf.direct_from_cpfp_refund_signature = dfc.clone();
                }
            }
            Ok(())
        })?;
        let updated = self.node.stores().transfers.compare_and_swap_status(
            &transfer_id,
            &[TransferStatus::SenderInitiated],
            TransferStatus::SenderKeyTweakPending,
        )?;
        self.node.journal(&transfer_id, JournalEvent::RefundsSigned);
        tracing::info!(transfer_id = %transfer_id, "refund transactions signed");

        let proto = transfer_to_proto(&updated, self.node.stores().leaves.as_ref());
        Ok((proto, leaf_results))
    }

    /// Translate user signing jobs into ceremony specs, validating the
    /// signing keys and computing sighashes from local rows.
    fn build_signing_specs(
        &self,
        request: &spark::InitiateTransferRequest,
    ) -> Result<Vec<SigningJobSpec>, OperatorError> {
        let mut specs = Vec::new();
        let user_presigned = request.leaves.iter().all(|l| {
            l.cpfp_refund_tx_signing_job
                .as_ref()
                .map(|j| !j.user_signature.is_empty())
                .unwrap_or(false)
        });

        for leaf_job in &request.leaves {
            let leaf = self
                .node
                .stores()
                .leaves
                .get(&leaf_job.leaf_id)
                .map_err(|_| OperatorError::NotFound("unknown leaf"))?;

            let mut push = |variant: RefundVariant,
                            job: &spark::UserRefundTxSigningJob|
             -> Result<(), OperatorError> {
                let signing_pubkey = pubkey33(&job.signing_pubkey, "signing key")?;
                if signing_pubkey != leaf.owner_signing_pubkey {
                    return Err(OperatorError::InvalidArgument("mismatched signing-key derivation"));
                }
                let message = match variant {
                    RefundVariant::Direct => {
                        let direct_tx = leaf
                            .direct_tx
                            .as_ref()
                            .ok_or(OperatorError::InvalidArgument("leaf has no direct tx"))?;
                        refund_sighash(direct_tx, 0, &job.raw_tx)?
                    }
                    _ => refund_sighash(&leaf.node_tx, leaf.vout, &job.raw_tx)?,
                };
                let user_commitment = job
                    .user_nonce_commitment
                    .as_ref()
                    .ok_or(OperatorError::InvalidArgument("missing user nonce commitment"))?;

                let mut spec = SigningJobSpec::new(
                    &leaf_job.leaf_id,
                    variant,
                    &leaf.keyshare_id,
                    message,
                    leaf.verifying_pubkey,
                    signing_pubkey,
                    commitment_from_proto(user_commitment)?,
                );
                if user_presigned {
                    if job.user_signature.is_empty() {
                        return Err(OperatorError::InvalidArgument(
                            "pre-signed transfers must sign every refund variant",
                        ));
                    }
                    spec.user_partial = Some(
                        spark_crypto::frost::signature_share_from_bytes(&job.user_signature)
                            .map_err(|_| OperatorError::InvalidArgument("malformed user signature"))?,
                    );
                    let mut preset = BTreeMap::new();
                    for (op_id, commitment) in &job.operator_commitments {
                        let op = self
                            .node
                            .config()
                            .operator_by_id(op_id)
                            .ok_or(OperatorError::InvalidArgument("unknown operator in commitments"))?;
                        preset.insert(op.index, commitment_from_proto(commitment)?);
                    }
                    spec.preset_commitments = Some(preset);
                }
                specs.push(spec);
                Ok(())
            };

            let cpfp = leaf_job
                .cpfp_refund_tx_signing_job
                .as_ref()
                .ok_or(OperatorError::InvalidArgument("missing cpfp signing job"))?;
            push(RefundVariant::Cpfp, cpfp)?;
            if let Some(job) = &leaf_job.direct_refund_tx_signing_job {
                push(RefundVariant::Direct, job)?;
            }
            if let Some(job) = &leaf_job.direct_from_cpfp_refund_tx_signing_job {
                push(RefundVariant::DirectFromCpfp, job)?;
            }
        }
        Ok(specs)
    }
}

/// Build the internal initiation mirror of a user request.
fn build_internal_initiate(
    request: &spark::InitiateTransferRequest,
) -> internal::InitiateTransferInternal {
    internal::InitiateTransferInternal {
        transfer_id: request.transfer_id.clone(),
        transfer_type: request.transfer_type,
        expiry_time: request.expiry_time.clone(),
        sender_identity_pubkey: request.sender_identity_pubkey.clone(),
        receiver_identity_pubkey: request.receiver_identity_pubkey.clone(),
        network: request.network,
        leaves: request
            .leaves
            .iter()
            .map(|l| internal::InitiateLeaf {
                leaf_id: l.leaf_id.clone(),
                cpfp_refund_tx: l
                    .cpfp_refund_tx_signing_job
                    .as_ref()
                    .map(|j| j.raw_tx.clone())
                    .unwrap_or_default(),
                direct_refund_tx: l
                    .direct_refund_tx_signing_job
                    .as_ref()
                    .map(|j| j.raw_tx.clone())
                    .unwrap_or_default(),
                direct_from_cpfp_refund_tx: l
                    .direct_from_cpfp_refund_tx_signing_job
                    .as_ref()
                    .map(|j| j.raw_tx.clone())
                    .unwrap_or_default(),
                secret_cipher: l.secret_cipher.clone(),
                signature: l.signature.clone(),
            })
            .collect(),
        payment_hash: request.payment_hash.clone(),
    }
}

/// Group per-variant ceremony results back into per-leaf wire results.
fn assemble_leaf_results(
    request: &spark::InitiateTransferRequest,
    results: &[SignedJobResult],
    config: &config::FederationConfig,
) -> Vec<spark::LeafSigningResult> {
    request
        .leaves
        .iter()
        .map(|leaf_job| {
            let mut out = spark::LeafSigningResult {
                leaf_id: leaf_job.leaf_id.clone(),
                verifying_pubkey: Bytes::new(),
                cpfp: None,
                direct: None,
                direct_from_cpfp: None,
            };
            for result in results.iter().filter(|r| r.leaf_id == leaf_job.leaf_id) {
                out.verifying_pubkey = Bytes::copy_from_slice(&result.verifying_pubkey);
                let proto = result.to_proto(config);
                match result.variant {
                    RefundVariant::Cpfp => out.cpfp = Some(proto),
                    RefundVariant::Direct => out.direct = Some(proto),
                    RefundVariant::DirectFromCpfp => out.direct_from_cpfp = Some(proto),
                }
            }
            out
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Key tweak, cancel, queries
// ---------------------------------------------------------------------------

impl<C: FollowerClient + 'static> Coordinator<C> {
    /// Accept the sender's key-tweak payload and fan it out. Retryable:
    /// followers that already applied acknowledge idempotently, and the
    /// transfer stays in `SENDER_KEY_TWEAK_PENDING` until every operator
    /// has tweaked (and, for cooperative exits, the chain gate opens).
    pub async fn send_transfer_tweak_key(
        &self,
        request: spark::SendTransferTweakKeyRequest,
    ) -> Result<spark::SendTransferTweakKeyResponse, OperatorError> {
        let transfer = self
            .node
            .stores()
            .transfers
            .get(&request.transfer_id)
            .map_err(|_| OperatorError::NotFound("transfer not found"))?;
        let sender = pubkey33(&request.sender_identity_pubkey, "sender identity key")?;
        if sender != transfer.sender_identity {
            return Err(OperatorError::PermissionDenied("only the sender may tweak"));
        }

        let internal_request = internal::ApplyTweaksInternal {
            transfer_id: request.transfer_id.clone(),
            caller_identity_pubkey: request.sender_identity_pubkey.clone(),
            leaf_tweaks: request.leaf_tweaks.clone(),
            refund_signatures: request.refund_signatures.clone(),
            receiver_side: false,
        };

        // Verify and apply locally; this is where the tweak material is
        // actually checked against this operator's share.
        self.node.handle_apply_tweaks(internal_request.clone())?;

        let failures = self
            .fan_out(move |client, op_id| {
                let request = internal_request.clone();
                async move { client.apply_tweaks(&op_id, request).await }
            })
            .await;
        if !failures.is_empty() {
            // No compensation needed: application is idempotent, so the
            // sender retries the same call until all operators converge.
            return Err(worst_follower_error(failures));
        }

        let updated = self.node.stores().transfers.get(&request.transfer_id)?;
        Ok(spark::SendTransferTweakKeyResponse {
            transfer: Some(transfer_to_proto(&updated, self.node.stores().leaves.as_ref())),
        })
    }

    /// Cancel a transfer before the sender has tweaked. Leaves revert to
    /// the sender; consumed signing nonces are not recovered.
    pub async fn cancel_transfer(
        &self,
        request: spark::CancelTransferRequest,
    ) -> Result<spark::CancelTransferResponse, OperatorError> {
        let transfer = self
            .node
            .stores()
            .transfers
            .get(&request.transfer_id)
            .map_err(|_| OperatorError::NotFound("transfer not found"))?;
        let sender = pubkey33(&request.sender_identity_pubkey, "sender identity key")?;
        if sender != transfer.sender_identity {
            return Err(OperatorError::PermissionDenied("only the sender may cancel"));
        }

        self.node.handle_rollback_transfer(internal::RollbackTransferInternal {
            transfer_id: request.transfer_id.clone(),
            expired: false,
        })?;

        let transfer_id = request.transfer_id.clone();
        let failures = self
            .fan_out(move |client, op_id| {
                let request = internal::RollbackTransferInternal {
                    transfer_id: transfer_id.clone(),
                    expired: false,
                };
                async move { client.rollback_transfer(&op_id, request).await }
            })
            .await;
        if !failures.is_empty() {
            return Err(worst_follower_error(failures));
        }

        let updated = self.node.stores().transfers.get(&request.transfer_id)?;
        Ok(spark::CancelTransferResponse {
            transfer: Some(transfer_to_proto(&updated, self.node.stores().leaves.as_ref())),
        })
    }

    /// Transfers claimable (or resumable) by the receiver.
    pub fn query_pending_transfers(
        &self,
        request: spark::QueryPendingTransfersRequest,
    ) -> Result<spark::QueryPendingTransfersResponse, OperatorError> {
        let receiver = pubkey33(&request.receiver_identity_pubkey, "receiver identity key")?;
        let network = config::Network::from_proto(request.network)
            .ok_or(OperatorError::InvalidArgument("unknown network"))?;
        let rows = self.node.stores().transfers.query_pending(&receiver, network)?;
        Ok(spark::QueryPendingTransfersResponse {
            transfers: rows
                .iter()
                .map(|row| transfer_to_proto(row, self.node.stores().leaves.as_ref()))
                .collect(),
        })
    }

    /// Paginated transfer history for an identity, oldest first. The
    /// status field distinguishes "not yet pending" from "permanently
    /// gone" (cancelled or expired).
    pub fn query_all_transfers(
        &self,
        request: spark::QueryAllTransfersRequest,
    ) -> Result<spark::QueryAllTransfersResponse, OperatorError> {
        let identity = pubkey33(&request.identity_pubkey, "identity key")?;
        if request.limit == 0 {
            return Err(OperatorError::InvalidArgument("limit must be positive"));
        }
        let types: Vec<TransferType> = request
            .types
            .iter()
            .map(|t| TransferType::from_proto(*t).ok_or(OperatorError::InvalidArgument("unknown transfer type")))
            .collect::<Result<_, _>>()?;

        let (rows, next_offset) = self.node.stores().transfers.query_all(
            &identity,
            request.limit as usize,
            request.offset as usize,
            &types,
        )?;
        Ok(spark::QueryAllTransfersResponse {
            transfers: rows
                .iter()
                .map(|row| transfer_to_proto(row, self.node.stores().leaves.as_ref()))
                .collect(),
            next_offset: next_offset as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_error_prefers_non_transient_failures() {
        let transient = (1u16, RpcError::Status {
            code: tonic::Code::Unavailable,
            message: "down".into(),
        });
        let precondition = (2u16, RpcError::failed_precondition("leaf not available"));

        assert!(matches!(
            worst_follower_error(vec![transient.clone()]),
            OperatorError::Aborted(_)
        ));
        assert!(matches!(
            worst_follower_error(vec![transient, precondition]),
            OperatorError::FailedPrecondition(_)
        ));
    }
}

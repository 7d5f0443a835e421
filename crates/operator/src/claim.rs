//! The receiver-side claim path.
//!
//! Claiming is three resumable steps, each gated on the persisted
//! transfer status:
//!
//! 1. [`Coordinator::claim_transfer_tweak_keys`] -- rotate the shares to
//!    the receiver's fresh key (`SENDER_KEY_TWEAKED →
//!    RECEIVER_KEY_TWEAKED`)
//! 2. [`Coordinator::claim_transfer_sign_refunds`] -- run the signing
//!    ceremony over the receiver's new refund transactions
//!    (`→ RECEIVER_REFUND_SIGNED`)
//! 3. [`Coordinator::claim_transfer_finalize`] -- verify and persist the
//!    aggregated signatures on every operator (`→ COMPLETED`)
//!
//! Concurrent claimers contend on a per-transfer claim lock: the loser
//! observes `Conflict` immediately rather than blocking. A claimer that
//! re-derives the same keys (the deterministic-wallet case) resumes
//! idempotently; one that shows up with different keys after a winner has
//! rotated is refused.

use std::sync::Arc;

use bytes::Bytes;

use storage::transfer::{TransferRow, TransferStatus, TransferStore};
use transport::internal;
use transport::rpc::FollowerClient;
use transport::spark;

use crate::bitcoin_tx::{refund_sighash, verify_refund_signature, verify_sequence_preserved};
use crate::convert::{decode_signing_results, encode_signing_results};
use crate::coordinator::Coordinator;
use crate::error::OperatorError;
use crate::signing::{commitment_from_proto, RefundVariant, SigningJobSpec};
use crate::pubkey33;

// ---------------------------------------------------------------------------
// Claim lock guard
// ---------------------------------------------------------------------------

/// Releases the claim lock when the step finishes, success or not.
struct ClaimGuard<'a> {
    store: &'a dyn TransferStore,
    transfer_id: &'a str,
}

impl<'a> ClaimGuard<'a> {
    fn acquire(store: &'a dyn TransferStore, transfer_id: &'a str) -> Result<Self, OperatorError> {
        if !store.try_lock_claim(transfer_id) {
            return Err(OperatorError::Conflict("concurrent claim in progress"));
        }
        Ok(Self { store, transfer_id })
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.store.unlock_claim(self.transfer_id);
    }
}

// ---------------------------------------------------------------------------
// Shared preamble
// ---------------------------------------------------------------------------

fn load_for_receiver(
    coordinator_node: &crate::OperatorNode,
    transfer_id: &str,
    receiver_bytes: &[u8],
) -> Result<(TransferRow, [u8; 33]), OperatorError> {
    let transfer = coordinator_node
        .stores()
        .transfers
        .get(transfer_id)
        .map_err(|_| OperatorError::NotFound("transfer not found"))?;
    let receiver = pubkey33(receiver_bytes, "receiver identity key")?;
    if receiver != transfer.receiver_identity {
        return Err(OperatorError::PermissionDenied("transfer is for a different receiver"));
    }
    Ok((transfer, receiver))
}

/// Errors for a transfer that is not in one of `allowed`.
fn check_claim_status(status: TransferStatus, allowed: &[TransferStatus]) -> Result<(), OperatorError> {
    if allowed.contains(&status) {
        return Ok(());
    }
    Err(match status {
        TransferStatus::Completed => OperatorError::Conflict("transfer already claimed"),
        TransferStatus::Cancelled | TransferStatus::Expired => {
            OperatorError::FailedPrecondition("transfer is no longer claimable")
        }
        TransferStatus::SenderInitiated | TransferStatus::SenderKeyTweakPending => {
            OperatorError::FailedPrecondition("transfer is not yet claimable")
        }
        TransferStatus::SenderKeyTweaked => {
            OperatorError::FailedPrecondition("claim key tweaks must be applied first")
        }
        TransferStatus::ReceiverKeyTweaked => {
            OperatorError::FailedPrecondition("refunds must be signed first")
        }
        TransferStatus::ReceiverRefundSigned => {
            OperatorError::FailedPrecondition("claim already past this step")
        }
    })
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

impl<C: FollowerClient + 'static> Coordinator<C> {
    /// Step 1: apply the receiver's key tweaks on every operator.
    pub async fn claim_transfer_tweak_keys(
        &self,
        request: spark::ClaimTransferTweakKeysRequest,
    ) -> Result<spark::ClaimTransferTweakKeysResponse, OperatorError> {
        let (transfer, _receiver) =
            load_for_receiver(&self.node, &request.transfer_id, &request.receiver_identity_pubkey)?;
        check_claim_status(
            transfer.status,
            &[
                TransferStatus::SenderKeyTweaked,
                // Re-delivery after a partial fan-out; the follower
                // handler verifies the tweak matches what was applied.
                TransferStatus::ReceiverKeyTweaked,
                TransferStatus::ReceiverRefundSigned,
            ],
        )?;

        let _guard = ClaimGuard::acquire(self.node.stores().transfers.as_ref(), &request.transfer_id)?;

        let internal_request = internal::ApplyTweaksInternal {
            transfer_id: request.transfer_id.clone(),
            caller_identity_pubkey: request.receiver_identity_pubkey.clone(),
            leaf_tweaks: request.leaf_tweaks.clone(),
            refund_signatures: Vec::new(),
            receiver_side: true,
        };

        self.node.handle_apply_tweaks(internal_request.clone())?;

        let mut set = tokio::task::JoinSet::new();
        for op in self.node.config().operators() {
            if op.index == self.node.self_index() {
                continue;
            }
            let client = Arc::clone(&self.client);
            let op_id = op.id.clone();
            let fan_request = internal_request.clone();
            set.spawn(async move { client.apply_tweaks(&op_id, fan_request).await });
        }
        while let Some(joined) = set.join_next().await {
            joined
                .map_err(|_| OperatorError::Internal("join failed"))?
                .map_err(OperatorError::from)?;
        }

        Ok(spark::ClaimTransferTweakKeysResponse {})
    }

    /// Step 2: sign the receiver's new refund transactions and return
    /// the operator material for client-side aggregation.
    ///
    /// Re-invocation with the same refund transactions returns the stored
    /// results without consuming additional nonces.
    pub async fn claim_transfer_sign_refunds(
        &self,
        request: spark::ClaimTransferSignRefundsRequest,
    ) -> Result<spark::ClaimTransferSignRefundsResponse, OperatorError> {
        let (transfer, _receiver) =
            load_for_receiver(&self.node, &request.transfer_id, &request.receiver_identity_pubkey)?;
        check_claim_status(
            transfer.status,
            &[TransferStatus::ReceiverKeyTweaked, TransferStatus::ReceiverRefundSigned],
        )?;

        let _guard = ClaimGuard::acquire(self.node.stores().transfers.as_ref(), &request.transfer_id)?;

        if request.signing_jobs.len() != transfer.leaves.len() {
            return Err(OperatorError::InvalidArgument("signing jobs must cover every leaf"));
        }

        // Idempotent replay: same refund txs, stored results.
        if transfer.status == TransferStatus::ReceiverRefundSigned {
            if let Some(blob) = &transfer.claim_signing_results_blob {
                let matches = request.signing_jobs.iter().all(|job| {
                    transfer
                        .leaf(&job.leaf_id)
                        .zip(job.cpfp_refund_tx_signing_job.as_ref())
                        .map(|(state, j)| state.pending_cpfp_refund_tx == j.raw_tx.as_ref())
                        .unwrap_or(false)
                });
                if matches {
                    return Ok(spark::ClaimTransferSignRefundsResponse {
                        signing_results: decode_signing_results(blob),
                    });
                }
            }
        }

        // Build ceremony specs: the claim keeps the sequence of the
        // generation it re-signs, so the timelock clock does not move.
        let mut specs = Vec::new();
        let mut new_refunds: Vec<(String, Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>)> = Vec::new();
        for job in &request.signing_jobs {
            let leaf = self
                .node
                .stores()
                .leaves
                .get(&job.leaf_id)
                .map_err(|_| OperatorError::NotFound("unknown leaf"))?;
            if transfer.leaf(&job.leaf_id).is_none() {
                return Err(OperatorError::InvalidArgument("signing job names a leaf outside the transfer"));
            }

            let cpfp = job
                .cpfp_refund_tx_signing_job
                .as_ref()
                .ok_or(OperatorError::InvalidArgument("missing cpfp signing job"))?;
            let signing_pubkey = pubkey33(&cpfp.signing_pubkey, "signing key")?;
            if signing_pubkey != leaf.owner_signing_pubkey {
                return Err(OperatorError::InvalidArgument("mismatched signing-key derivation"));
            }
            if let Some(current) = &leaf.refund_tx {
                verify_sequence_preserved(current, &cpfp.raw_tx)?;
            }
            if let (Some(current), Some(new)) = (
                &leaf.direct_from_cpfp_refund_tx,
                &job.direct_from_cpfp_refund_tx_signing_job,
            ) {
                verify_sequence_preserved(current, &new.raw_tx)?;
            }

            self.push_claim_spec(&mut specs, &leaf, job, RefundVariant::Cpfp, cpfp)?;
            if let Some(direct) = &job.direct_refund_tx_signing_job {
                self.push_claim_spec(&mut specs, &leaf, job, RefundVariant::Direct, direct)?;
            }
            if let Some(dfc) = &job.direct_from_cpfp_refund_tx_signing_job {
                self.push_claim_spec(&mut specs, &leaf, job, RefundVariant::DirectFromCpfp, dfc)?;
            }

            new_refunds.push((
                job.leaf_id.clone(),
                cpfp.raw_tx.to_vec(),
                job.direct_refund_tx_signing_job
                    .as_ref()
                    .map(|j| j.raw_tx.to_vec()),
                job.direct_from_cpfp_refund_tx_signing_job
                    .as_ref()
                    .map(|j| j.raw_tx.to_vec()),
            ));
        }

        let results = self.run_signing_ceremony(&specs).await?;

        // Reassemble per leaf.
        let leaf_results: Vec<spark::LeafSigningResult> = request
            .signing_jobs
            .iter()
            .map(|job| {
                let mut out = spark::LeafSigningResult {
                    leaf_id: job.leaf_id.clone(),
                    verifying_pubkey: Bytes::new(),
                    cpfp: None,
                    direct: None,
                    direct_from_cpfp: None,
                };
                for result in results.iter().filter(|r| r.leaf_id == job.leaf_id) {
                    out.verifying_pubkey = Bytes::copy_from_slice(&result.verifying_pubkey);
                    let proto = result.to_proto(self.node.config());
                    match result.variant {
                        RefundVariant::Cpfp => out.cpfp = Some(proto),
                        RefundVariant::Direct => out.direct = Some(proto),
                        RefundVariant::DirectFromCpfp => out.direct_from_cpfp = Some(proto),
                    }
                }
                out
            })
            .collect();

        let blob = encode_signing_results(&leaf_results);
        self.node.stores().transfers.update(&request.transfer_id, &mut |row| {
            row.claim_signing_results_blob = Some(blob.clone());
            for (leaf_id, cpfp, direct, dfc) in &new_refunds {
                if let Some(leaf) = row.leaves.iter_mut().find(|l| &l.leaf_id == leaf_id) {
                    leaf.pending_cpfp_refund_tx = cpfp.clone();
                    leaf.pending_direct_refund_tx = direct.clone();
                    leaf.pending_direct_from_cpfp_refund_tx = dfc.clone();
                }
            }
            Ok(())
        })?;
        self.node.stores().transfers.compare_and_swap_status(
            &request.transfer_id,
            &[TransferStatus::ReceiverKeyTweaked, TransferStatus::ReceiverRefundSigned],
            TransferStatus::ReceiverRefundSigned,
        )?;

        Ok(spark::ClaimTransferSignRefundsResponse {
            signing_results: leaf_results,
        })
    }

    fn push_claim_spec(
        &self,
        specs: &mut Vec<SigningJobSpec>,
        leaf: &storage::leaf::TreeNode,
        leaf_job: &spark::TransferLeafJob,
        variant: RefundVariant,
        job: &spark::UserRefundTxSigningJob,
    ) -> Result<(), OperatorError> {
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
        specs.push(SigningJobSpec::new(
            &leaf_job.leaf_id,
            variant,
            &leaf.keyshare_id,
            message,
            leaf.verifying_pubkey,
            signing_pubkey,
            commitment_from_proto(user_commitment)?,
        ));
        Ok(())
    }

    /// Step 3: verify the aggregated signatures, distribute them to every
    /// operator, and complete the transfer.
    pub async fn claim_transfer_finalize(
        &self,
        request: spark::ClaimTransferFinalizeRequest,
    ) -> Result<spark::ClaimTransferFinalizeResponse, OperatorError> {
        let (transfer, _receiver) =
            load_for_receiver(&self.node, &request.transfer_id, &request.receiver_identity_pubkey)?;
        if transfer.status == TransferStatus::Completed {
            return Ok(spark::ClaimTransferFinalizeResponse {});
        }
        check_claim_status(transfer.status, &[TransferStatus::ReceiverRefundSigned])?;

        let _guard = ClaimGuard::acquire(self.node.stores().transfers.as_ref(), &request.transfer_id)?;

        if request.signatures.len() != transfer.leaves.len() {
            return Err(OperatorError::InvalidArgument("signatures must cover every leaf"));
        }

        // Validate every user-supplied signature before any persistence.
        let mut settle_leaves = Vec::with_capacity(request.signatures.len());
        for sig in &request.signatures {
            let state = transfer
                .leaf(&sig.leaf_id)
                .ok_or(OperatorError::InvalidArgument("signature names a leaf outside the transfer"))?;
            let leaf = self
                .node
                .stores()
                .leaves
                .get(&sig.leaf_id)
                .map_err(|_| OperatorError::NotFound("unknown leaf"))?;

            let sighash = refund_sighash(&leaf.node_tx, leaf.vout, &state.pending_cpfp_refund_tx)?;
            verify_refund_signature(&leaf.verifying_pubkey, &sighash, &sig.cpfp_signature)?;

            if let Some(pending) = &state.pending_direct_from_cpfp_refund_tx {
                let sighash = refund_sighash(&leaf.node_tx, leaf.vout, pending)?;
                verify_refund_signature(&leaf.verifying_pubkey, &sighash, &sig.direct_from_cpfp_signature)?;
            }
            if let Some(pending) = &state.pending_direct_refund_tx {
                let direct_tx = leaf
                    .direct_tx
                    .as_ref()
                    .ok_or(OperatorError::InvalidArgument("leaf has no direct tx"))?;
                let sighash = refund_sighash(direct_tx, 0, pending)?;
                verify_refund_signature(&leaf.verifying_pubkey, &sighash, &sig.direct_signature)?;
            }

            settle_leaves.push(internal::SettleLeaf {
                leaf_id: sig.leaf_id.clone(),
                cpfp_refund_tx: Bytes::from(state.pending_cpfp_refund_tx.clone()),
                direct_refund_tx: state
                    .pending_direct_refund_tx
                    .clone()
                    .map(Bytes::from)
                    .unwrap_or_default(),
                direct_from_cpfp_refund_tx: state
                    .pending_direct_from_cpfp_refund_tx
                    .clone()
                    .map(Bytes::from)
                    .unwrap_or_default(),
                signature: Some(sig.clone()),
            });
        }

        let settle_request = internal::SettleClaimInternal {
            transfer_id: request.transfer_id.clone(),
            leaves: settle_leaves,
        };

        // Followers first: if any is unreachable the claim stays in
        // RECEIVER_REFUND_SIGNED and the retry re-fans idempotently.
        let mut set = tokio::task::JoinSet::new();
        for op in self.node.config().operators() {
            if op.index == self.node.self_index() {
                continue;
            }
            let client = Arc::clone(&self.client);
            let op_id = op.id.clone();
            let fan_request = settle_request.clone();
            set.spawn(async move { client.settle_claim(&op_id, fan_request).await });
        }
        while let Some(joined) = set.join_next().await {
            joined
                .map_err(|_| OperatorError::Internal("join failed"))?
                .map_err(OperatorError::from)?;
        }

        self.node.handle_settle_claim(settle_request)?;

        Ok(spark::ClaimTransferFinalizeResponse {})
    }
}

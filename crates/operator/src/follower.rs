//! Follower-side handlers for the internal operator service.
//!
//! Every handler here is idempotent against retries: a transfer that
//! already exists acknowledges instead of re-locking, a tweak that is
//! already applied is skipped (after checking it matches what was
//! applied), and rollback of a missing or terminal transfer succeeds.
//! Multi-row writes for one transition commit together under the stores'
//! row locks.

use bitcoin::secp256k1::{PublicKey, SecretKey};
use k256::Scalar;

use spark_crypto::{secp, vss};
use storage::keyshare::{KeyshareStatus, SigningKeyshare};
use storage::leaf::{TreeNode, TreeNodeStatus};
use storage::transfer::{TransferLeaf, TransferRow, TransferStatus, TransferType};
use storage::journal::JournalEvent;
use storage::StorageError;
use transport::internal;
use transport::spark;

use crate::bitcoin_tx::{refund_sighash, verify_refund_signature, verify_sequence_decremented};
use crate::convert::timestamp_secs;
use crate::error::OperatorError;
use crate::{now_unix, pubkey33, OperatorNode};

// ---------------------------------------------------------------------------
// Tweak verification
// ---------------------------------------------------------------------------

/// The state changes a verified tweak will commit.
struct TweakApplication {
    new_secret_share: [u8; 32],
    new_public_shares: std::collections::BTreeMap<String, [u8; 33]>,
    new_public_key: [u8; 33],
    new_owner_signing_pubkey: [u8; 33],
}

impl OperatorNode {
    /// Verify a key tweak for one leaf against this operator's share.
    ///
    /// Accepts iff:
    /// 1. the VSS proof vector validates this operator's share,
    /// 2. the share's public image matches the advertised per-operator
    ///    pubkey tweak for this operator,
    /// 3. the advertised verifying key equals the leaf's (the tweak moves
    ///    the owner key and the operator aggregate in opposite
    ///    directions, so the joint key is invariant), and
    /// 4. the owner key shift equals the tweak's free-coefficient proof:
    ///    `old_owner = new_owner + proofs[0]`.
    fn verify_leaf_tweak(
        &self,
        leaf: &TreeNode,
        keyshare: &SigningKeyshare,
        tweak: &spark::LeafTweakProto,
    ) -> Result<TweakApplication, OperatorError> {
        let self_id = self.id();
        let min_signers = self.config().min_signers;

        let my_share = tweak
            .secret_shares
            .get(self_id)
            .ok_or(OperatorError::InvalidArgument("tweak missing this operator's share"))?;
        if my_share.proofs.len() != min_signers {
            return Err(OperatorError::InvalidArgument("tweak proof count must equal the threshold"));
        }

        // (1) VSS proof validation.
        let value = vss::scalar_from_bytes(&my_share.secret_share)
            .map_err(|_| OperatorError::InvalidArgument("tweak share is not a valid scalar"))?;
        let proofs: Vec<k256::PublicKey> = my_share
            .proofs
            .iter()
            .map(|p| k256::PublicKey::from_sec1_bytes(p))
            .collect::<Result<_, _>>()
            .map_err(|_| OperatorError::InvalidArgument("tweak proof is not a valid point"))?;
        let share = vss::VerifiableShare {
            threshold: min_signers,
            index: Scalar::from(u64::from(self.self_index()) + 1),
            value,
            proofs,
        };
        vss::validate_share(&share)
            .map_err(|_| OperatorError::InvalidArgument("tweak share failed proof validation"))?;

        // (2) Share image must match the advertised per-operator tweak.
        let delta = SecretKey::from_slice(&my_share.secret_share)
            .map_err(|_| OperatorError::InvalidArgument("tweak share is not a valid scalar"))?;
        let advertised = tweak
            .pubkey_shares_tweak
            .get(self_id)
            .and_then(|b| PublicKey::from_slice(b).ok())
            .ok_or(OperatorError::InvalidArgument("tweak missing this operator's pubkey share"))?;
        if secp::public_key_of(&delta) != advertised {
            return Err(OperatorError::InvalidArgument("tweak share does not match its public image"));
        }

        // (3) Verifying key invariance.
        if tweak.verifying_pubkey.as_ref() != leaf.verifying_pubkey.as_slice() {
            return Err(OperatorError::InvalidArgument("tweak must preserve the verifying key"));
        }

        // (4) Owner shift consistency.
        let aggregate_image = PublicKey::from_slice(&my_share.proofs[0])
            .map_err(|_| OperatorError::InvalidArgument("tweak proof is not a valid point"))?;
        let new_owner = pubkey33(&tweak.new_owner_signing_pubkey, "new owner signing key")?;
        let new_owner_pk = PublicKey::from_slice(&new_owner)
            .map_err(|_| OperatorError::InvalidArgument("new owner signing key invalid"))?;
        let old_owner_pk = PublicKey::from_slice(&leaf.owner_signing_pubkey)
            .map_err(|_| OperatorError::Internal("corrupt leaf owner key"))?;
        let shifted = secp::add_public_keys(&new_owner_pk, &aggregate_image)
            .map_err(|_| OperatorError::InvalidArgument("owner key shift is degenerate"))?;
        if shifted != old_owner_pk {
            return Err(OperatorError::InvalidArgument("owner key shift does not match the tweak"));
        }

        // Build the successor share material.
        let old_secret = SecretKey::from_slice(&keyshare.secret_share)
            .map_err(|_| OperatorError::Internal("corrupt keyshare"))?;
        let new_secret = secp::add_secret_keys(&old_secret, &delta)
            .map_err(|_| OperatorError::InvalidArgument("tweak produces an invalid share"))?;

        let mut new_public_shares = std::collections::BTreeMap::new();
        for (op_id, old_pk) in &keyshare.public_shares {
            let tweak_pk = tweak
                .pubkey_shares_tweak
                .get(op_id)
                .and_then(|b| PublicKey::from_slice(b).ok())
                .ok_or(OperatorError::InvalidArgument("tweak missing an operator pubkey share"))?;
            let old = PublicKey::from_slice(old_pk)
                .map_err(|_| OperatorError::Internal("corrupt keyshare public share"))?;
            let new = secp::add_public_keys(&old, &tweak_pk)
                .map_err(|_| OperatorError::InvalidArgument("tweaked public share is degenerate"))?;
            new_public_shares.insert(op_id.clone(), new.serialize());
        }

        let old_group = PublicKey::from_slice(&keyshare.public_key)
            .map_err(|_| OperatorError::Internal("corrupt keyshare group key"))?;
        let new_group = secp::add_public_keys(&old_group, &aggregate_image)
            .map_err(|_| OperatorError::InvalidArgument("tweaked group key is degenerate"))?;

        Ok(TweakApplication {
            new_secret_share: new_secret.secret_bytes(),
            new_public_shares,
            new_public_key: new_group.serialize(),
            new_owner_signing_pubkey: new_owner,
        })
    }
}

// ---------------------------------------------------------------------------
// Initiation
// ---------------------------------------------------------------------------

impl OperatorNode {
    /// Lock the named leaves and persist a new transfer row.
    ///
    /// All leaves lock or none do: a failure on the nth leaf releases the
    /// locks already taken before returning. A transfer that already
    /// exists acknowledges without re-locking.
    pub fn handle_initiate_transfer(
        &self,
        request: internal::InitiateTransferInternal,
    ) -> Result<(), OperatorError> {
        if request.transfer_id.is_empty() {
            return Err(OperatorError::InvalidArgument("missing transfer id"));
        }
        if self.stores().transfers.get(&request.transfer_id).is_ok() {
            return Ok(());
        }

        let transfer_type = TransferType::from_proto(request.transfer_type)
            .ok_or(OperatorError::InvalidArgument("unknown transfer type"))?;
        let network = config::Network::from_proto(request.network)
            .filter(|n| *n == self.config().network)
            .ok_or(OperatorError::InvalidArgument("wrong network"))?;
        let sender = pubkey33(&request.sender_identity_pubkey, "sender identity key")?;
        let receiver = pubkey33(&request.receiver_identity_pubkey, "receiver identity key")?;
        let expiry_time = timestamp_secs(request.expiry_time.as_ref())
            .ok_or(OperatorError::InvalidArgument("missing expiry time"))?;
        if expiry_time <= now_unix() {
            return Err(OperatorError::InvalidArgument("expiry time is in the past"));
        }
        if request.leaves.is_empty() {
            return Err(OperatorError::InvalidArgument("transfer must include at least one leaf"));
        }
        let mut seen = std::collections::HashSet::new();
        for leaf in &request.leaves {
            if !seen.insert(leaf.leaf_id.as_str()) {
                return Err(OperatorError::InvalidArgument("duplicate leaf in transfer"));
            }
        }
        let payment_hash = if transfer_type.requires_preimage() {
            Some(
                request
                    .payment_hash
                    .as_ref()
                    .try_into()
                    .map_err(|_| OperatorError::InvalidArgument("payment hash must be 32 bytes"))?,
            )
        } else {
            None
        };

        // Validate refund transactions against local rows before locking.
        for leaf_req in &request.leaves {
            let leaf = self
                .stores()
                .leaves
                .get(&leaf_req.leaf_id)
                .map_err(|_| OperatorError::NotFound("unknown leaf"))?;
            if leaf.network != network {
                return Err(OperatorError::InvalidArgument("leaf is on a different network"));
            }
            if leaf_req.cpfp_refund_tx.is_empty() {
                return Err(OperatorError::InvalidArgument("missing cpfp refund transaction"));
            }
            if let Some(old) = &leaf.refund_tx {
                verify_sequence_decremented(old, &leaf_req.cpfp_refund_tx)?;
            }
            if !leaf_req.direct_from_cpfp_refund_tx.is_empty() {
                if let Some(old) = &leaf.direct_from_cpfp_refund_tx {
                    verify_sequence_decremented(old, &leaf_req.direct_from_cpfp_refund_tx)?;
                }
            }
            if !leaf_req.direct_refund_tx.is_empty() {
                if let Some(old) = &leaf.direct_refund_tx {
                    verify_sequence_decremented(old, &leaf_req.direct_refund_tx)?;
                }
            }
        }

        // Lock all leaves, releasing on partial failure.
        let mut locked: Vec<&str> = Vec::with_capacity(request.leaves.len());
        for leaf_req in &request.leaves {
            match self.stores().leaves.lock_for_update(
                &leaf_req.leaf_id,
                &sender,
                TreeNodeStatus::TransferLocked,
            ) {
                Ok(leaf) => {
                    locked.push(&leaf_req.leaf_id);
                    if let Err(e) = self.stores().keyshares.mark_in_use(&leaf.keyshare_id) {
                        self.release_locks(&locked);
                        return Err(e.into());
                    }
                }
                Err(e) => {
                    self.release_locks(&locked);
                    return Err(match e {
                        StorageError::NotFound => OperatorError::NotFound("unknown leaf"),
                        StorageError::ConstraintViolation(_) => {
                            OperatorError::PermissionDenied("leaf not owned by sender")
                        }
                        StorageError::InvalidState(_) => {
                            OperatorError::FailedPrecondition("leaf not available")
                        }
                        other => other.into(),
                    });
                }
            }
        }

        let leaves = request
            .leaves
            .iter()
            .map(|l| {
                let mut leaf = TransferLeaf::new(
                    l.leaf_id.clone(),
                    l.cpfp_refund_tx.to_vec(),
                    (!l.direct_refund_tx.is_empty()).then(|| l.direct_refund_tx.to_vec()),
                    (!l.direct_from_cpfp_refund_tx.is_empty())
                        .then(|| l.direct_from_cpfp_refund_tx.to_vec()),
                );
                leaf.secret_cipher = l.secret_cipher.to_vec();
                leaf.sender_signature = l.signature.to_vec();
                leaf
            })
            .collect();

        let row = TransferRow {
            id: request.transfer_id.clone(),
            transfer_type,
            status: TransferStatus::SenderInitiated,
            sender_identity: sender,
            receiver_identity: receiver,
            expiry_time,
            network,
            leaves,
            payment_hash,
            preimage_revealed: false,
            signing_results_blob: None,
            claim_signing_results_blob: None,
        };
        if let Err(e) = self.stores().transfers.create(row) {
            self.release_locks(&locked);
            return Err(e.into());
        }

        self.journal(
            &request.transfer_id,
            JournalEvent::TransferCreated {
                transfer_type: format!("{transfer_type:?}"),
                sender: hex(&sender),
                receiver: hex(&receiver),
                leaf_count: request.leaves.len(),
            },
        );
        tracing::info!(
            operator = self.id(),
            transfer_id = %request.transfer_id,
            leaves = request.leaves.len(),
            "transfer initiated"
        );
        Ok(())
    }

    fn release_locks(&self, leaf_ids: &[&str]) {
        for id in leaf_ids {
            if let Err(e) = self.stores().leaves.unlock(id) {
                tracing::warn!(operator = self.id(), leaf_id = id, %e, "failed to release leaf lock");
            }
        }
    }

    /// Cooperative-exit initiation: the transfer plus the exit row the
    /// chain watcher will track.
    pub fn handle_initiate_cooperative_exit(
        &self,
        request: internal::InitiateCooperativeExitInternal,
    ) -> Result<(), OperatorError> {
        let transfer = request
            .transfer
            .ok_or(OperatorError::InvalidArgument("missing transfer"))?;
        if request.exit_id.is_empty() {
            return Err(OperatorError::InvalidArgument("missing exit id"));
        }
        let exit_txid: [u8; 32] = request
            .exit_txid
            .as_ref()
            .try_into()
            .map_err(|_| OperatorError::InvalidArgument("exit txid must be 32 bytes"))?;

        let transfer_id = transfer.transfer_id.clone();
        self.handle_initiate_transfer(transfer)?;

        match self.stores().transfers.insert_exit(storage::transfer::CooperativeExitRow {
            exit_id: request.exit_id.clone(),
            transfer_id,
            exit_txid,
            confirmation_height: None,
            chain_confirmed: false,
        }) {
            Ok(()) => Ok(()),
            // Retried initiation: the exit row already exists.
            Err(StorageError::ConstraintViolation(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Compensating rollback: release leaf locks and terminate the
    /// transfer. Refused once the sender has tweaked.
    pub fn handle_rollback_transfer(
        &self,
        request: internal::RollbackTransferInternal,
    ) -> Result<(), OperatorError> {
        let transfer = match self.stores().transfers.get(&request.transfer_id) {
            Ok(t) => t,
            Err(StorageError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if transfer.status.is_terminal() {
            return Ok(());
        }
        if transfer.sender_tweaked() {
            return Err(OperatorError::FailedPrecondition(
                "transfer cannot be rolled back after the sender key tweak",
            ));
        }
        if !matches!(
            transfer.status,
            TransferStatus::SenderInitiated | TransferStatus::SenderKeyTweakPending
        ) {
            return Err(OperatorError::FailedPrecondition("transfer is not cancellable"));
        }
        // A cooperative exit whose transaction already reached the
        // confirmation threshold cannot be unwound.
        if transfer.transfer_type.requires_chain_confirmation() {
            let confirmed = self
                .stores()
                .transfers
                .exit_for_transfer(&transfer.id)?
                .map(|e| e.chain_confirmed)
                .unwrap_or(false);
            if confirmed {
                return Err(OperatorError::FailedPrecondition(
                    "exit transaction already confirmed",
                ));
            }
        }

        for leaf in &transfer.leaves {
            if let Err(e) = self.stores().leaves.unlock(&leaf.leaf_id) {
                tracing::warn!(operator = self.id(), leaf_id = %leaf.leaf_id, %e, "rollback unlock failed");
            }
        }

        let terminal = if request.expired {
            TransferStatus::Expired
        } else {
            TransferStatus::Cancelled
        };
        let from = transfer.status;
        self.stores().transfers.compare_and_swap_status(
            &request.transfer_id,
            &[TransferStatus::SenderInitiated, TransferStatus::SenderKeyTweakPending],
            terminal,
        )?;

        self.journal(
            &request.transfer_id,
            JournalEvent::StatusChanged {
                from: from.as_str().to_owned(),
                to: terminal.as_str().to_owned(),
            },
        );
        tracing::info!(
            operator = self.id(),
            transfer_id = %request.transfer_id,
            to = terminal.as_str(),
            "transfer rolled back"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tweak application
// ---------------------------------------------------------------------------

impl OperatorNode {
    /// Verify and apply key tweaks for a transfer.
    ///
    /// The share rotation, leaf ownership move, and transfer bookkeeping
    /// commit together; a verification failure on any leaf applies
    /// nothing new (already-applied leaves from a prior retry stay as
    /// they are -- retried deliveries are the expected path after a
    /// partial fan-out failure).
    pub fn handle_apply_tweaks(
        &self,
        request: internal::ApplyTweaksInternal,
    ) -> Result<(), OperatorError> {
        let transfer = self
            .stores()
            .transfers
            .get(&request.transfer_id)
            .map_err(|_| OperatorError::NotFound("transfer not found"))?;
        let caller = pubkey33(&request.caller_identity_pubkey, "caller identity key")?;

        if request.receiver_side {
            self.apply_receiver_tweaks(&transfer, caller, &request)
        } else {
            self.apply_sender_tweaks(&transfer, caller, &request)
        }
    }

    fn apply_sender_tweaks(
        &self,
        transfer: &TransferRow,
        caller: [u8; 33],
        request: &internal::ApplyTweaksInternal,
    ) -> Result<(), OperatorError> {
        if caller != transfer.sender_identity {
            return Err(OperatorError::PermissionDenied("only the sender may tweak"));
        }
        if transfer.sender_tweaked() {
            // Re-delivery after a partial fan-out; make sure the gate
            // transition was not the part that got lost.
            self.maybe_open_sender_gate(transfer)?;
            return Ok(());
        }
        if transfer.status != TransferStatus::SenderKeyTweakPending {
            return Err(OperatorError::FailedPrecondition("transfer is not awaiting the key tweak"));
        }
        if now_unix() >= transfer.expiry_time {
            return Err(OperatorError::FailedPrecondition("transfer expired"));
        }

        self.check_tweak_coverage(transfer, &request.leaf_tweaks)?;
        self.verify_refund_signatures(transfer, &request.refund_signatures)?;

        for tweak in &request.leaf_tweaks {
            self.apply_one_tweak(transfer, tweak, false)?;
        }

        let refund_signatures = request.refund_signatures.clone();
        self.stores().transfers.update(&transfer.id, &mut |row| {
            for leaf in &mut row.leaves {
                leaf.sender_tweak_applied = true;
                if let Some(sig) = refund_signatures.iter().find(|s| s.leaf_id == leaf.leaf_id) {
                    if !sig.cpfp_signature.is_empty() {
                        leaf.cpfp_refund_signature = Some(sig.cpfp_signature.to_vec());
                    }
                    if !sig.direct_signature.is_empty() {
                        leaf.direct_refund_signature = Some(sig.direct_signature.to_vec());
                    }
                    if !sig.direct_from_cpfp_signature.is_empty() {
                        leaf.direct_from_cpfp_refund_signature =
                            Some(sig.direct_from_cpfp_signature.to_vec());
                    }
                }
            }
            Ok(())
        })?;

        self.maybe_open_sender_gate(&self.stores().transfers.get(&transfer.id)?)?;

        self.journal(&transfer.id, JournalEvent::SenderTweakApplied);
        tracing::info!(
            operator = self.id(),
            transfer_id = %transfer.id,
            "sender key tweak applied"
        );
        Ok(())
    }

    /// Advance `SENDER_KEY_TWEAK_PENDING → SENDER_KEY_TWEAKED` once every
    /// leaf is tweaked: immediately for plain transfers, only after the
    /// chain watcher confirms the exit for cooperative exits.
    fn maybe_open_sender_gate(&self, transfer: &TransferRow) -> Result<(), OperatorError> {
        if transfer.status != TransferStatus::SenderKeyTweakPending || !transfer.sender_tweaked() {
            return Ok(());
        }
        let gate_open = if transfer.transfer_type.requires_chain_confirmation() {
            self.stores()
                .transfers
                .exit_for_transfer(&transfer.id)?
                .map(|e| e.chain_confirmed)
                .unwrap_or(false)
        } else {
            true
        };
        if gate_open {
            self.stores().transfers.compare_and_swap_status(
                &transfer.id,
                &[TransferStatus::SenderKeyTweakPending],
                TransferStatus::SenderKeyTweaked,
            )?;
        }
        Ok(())
    }

    fn apply_receiver_tweaks(
        &self,
        transfer: &TransferRow,
        caller: [u8; 33],
        request: &internal::ApplyTweaksInternal,
    ) -> Result<(), OperatorError> {
        if caller != transfer.receiver_identity {
            return Err(OperatorError::PermissionDenied("only the receiver may claim"));
        }
        match transfer.status {
            TransferStatus::SenderKeyTweaked => {}
            TransferStatus::ReceiverKeyTweaked | TransferStatus::ReceiverRefundSigned => {
                // Re-delivery: accept only the tweak that was applied.
                return self.check_receiver_tweak_matches(transfer, &request.leaf_tweaks);
            }
            TransferStatus::Completed => {
                return Err(OperatorError::Conflict("transfer already claimed"));
            }
            TransferStatus::Cancelled | TransferStatus::Expired => {
                return Err(OperatorError::FailedPrecondition("transfer is no longer claimable"));
            }
            _ => {
                return Err(OperatorError::FailedPrecondition("transfer is not yet claimable"));
            }
        }

        if transfer.transfer_type.requires_chain_confirmation() {
            let confirmed = self
                .stores()
                .transfers
                .exit_for_transfer(&transfer.id)?
                .map(|e| e.chain_confirmed)
                .unwrap_or(false);
            if !confirmed {
                return Err(OperatorError::FailedPrecondition("insufficient confirmations"));
            }
        }
        if transfer.transfer_type.requires_preimage() && !transfer.preimage_revealed {
            return Err(OperatorError::FailedPrecondition("preimage not revealed"));
        }

        self.check_tweak_coverage(transfer, &request.leaf_tweaks)?;

        for tweak in &request.leaf_tweaks {
            self.apply_one_tweak(transfer, tweak, true)?;
        }

        self.stores().transfers.update(&transfer.id, &mut |row| {
            for leaf in &mut row.leaves {
                leaf.receiver_tweak_applied = true;
            }
            Ok(())
        })?;
        self.stores().transfers.compare_and_swap_status(
            &transfer.id,
            &[TransferStatus::SenderKeyTweaked],
            TransferStatus::ReceiverKeyTweaked,
        )?;

        self.journal(&transfer.id, JournalEvent::ReceiverTweakApplied);
        tracing::info!(operator = self.id(), transfer_id = %transfer.id, "receiver key tweak applied");
        Ok(())
    }

    /// Every transfer leaf must be covered by exactly one tweak.
    fn check_tweak_coverage(
        &self,
        transfer: &TransferRow,
        tweaks: &[spark::LeafTweakProto],
    ) -> Result<(), OperatorError> {
        if tweaks.len() != transfer.leaves.len() {
            return Err(OperatorError::InvalidArgument("tweaks must cover every leaf exactly once"));
        }
        for tweak in tweaks {
            if transfer.leaf(&tweak.leaf_id).is_none() {
                return Err(OperatorError::InvalidArgument("tweak names a leaf outside the transfer"));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for tweak in tweaks {
            if !seen.insert(tweak.leaf_id.as_str()) {
                return Err(OperatorError::InvalidArgument("duplicate tweak for a leaf"));
            }
        }
        Ok(())
    }

    /// A concurrent claimer re-delivering tweaks must match the rotation
    /// that won; anything else is a lost race.
    fn check_receiver_tweak_matches(
        &self,
        transfer: &TransferRow,
        tweaks: &[spark::LeafTweakProto],
    ) -> Result<(), OperatorError> {
        for tweak in tweaks {
            if transfer.leaf(&tweak.leaf_id).is_none() {
                return Err(OperatorError::InvalidArgument("tweak names a leaf outside the transfer"));
            }
            let leaf = self
                .stores()
                .leaves
                .get(&tweak.leaf_id)
                .map_err(|_| OperatorError::NotFound("unknown leaf"))?;
            if tweak.new_owner_signing_pubkey.as_ref() != leaf.owner_signing_pubkey.as_slice() {
                return Err(OperatorError::Conflict("transfer was claimed with a different key"));
            }
        }
        Ok(())
    }

    /// Sender-supplied final refund signatures must verify against the
    /// pending refund transactions before anything is persisted.
    fn verify_refund_signatures(
        &self,
        transfer: &TransferRow,
        signatures: &[spark::RefundSignature],
    ) -> Result<(), OperatorError> {
        for sig in signatures {
            let state = transfer
                .leaf(&sig.leaf_id)
                .ok_or(OperatorError::InvalidArgument("signature names a leaf outside the transfer"))?;
            let leaf = self
                .stores()
                .leaves
                .get(&sig.leaf_id)
                .map_err(|_| OperatorError::NotFound("unknown leaf"))?;

            if !sig.cpfp_signature.is_empty() {
                let sighash = refund_sighash(&leaf.node_tx, leaf.vout, &state.pending_cpfp_refund_tx)?;
                verify_refund_signature(&leaf.verifying_pubkey, &sighash, &sig.cpfp_signature)?;
            }
            if !sig.direct_from_cpfp_signature.is_empty() {
                let pending = state
                    .pending_direct_from_cpfp_refund_tx
                    .as_ref()
                    .ok_or(OperatorError::InvalidArgument("no pending direct-from-cpfp refund"))?;
                let sighash = refund_sighash(&leaf.node_tx, leaf.vout, pending)?;
                verify_refund_signature(&leaf.verifying_pubkey, &sighash, &sig.direct_from_cpfp_signature)?;
            }
            if !sig.direct_signature.is_empty() {
                let pending = state
                    .pending_direct_refund_tx
                    .as_ref()
                    .ok_or(OperatorError::InvalidArgument("no pending direct refund"))?;
                let direct_tx = leaf
                    .direct_tx
                    .as_ref()
                    .ok_or(OperatorError::InvalidArgument("leaf has no direct tx"))?;
                let sighash = refund_sighash(direct_tx, 0, pending)?;
                verify_refund_signature(&leaf.verifying_pubkey, &sighash, &sig.direct_signature)?;
            }
        }
        Ok(())
    }

    /// Verify and commit one leaf's rotation: keyshare successor, leaf
    /// ownership, and (sender side) the new refund transactions.
    fn apply_one_tweak(
        &self,
        transfer: &TransferRow,
        tweak: &spark::LeafTweakProto,
        receiver_side: bool,
    ) -> Result<(), OperatorError> {
        let leaf = self
            .stores()
            .leaves
            .get(&tweak.leaf_id)
            .map_err(|_| OperatorError::NotFound("unknown leaf"))?;

        let side = if receiver_side { "receiver" } else { "sender" };
        let successor_id = format!("{}:{}:{}", transfer.id, tweak.leaf_id, side);
        if leaf.keyshare_id == successor_id {
            // Already applied by a prior delivery.
            return Ok(());
        }

        let keyshare = self
            .stores()
            .keyshares
            .get(&leaf.keyshare_id)
            .map_err(|_| OperatorError::Internal("leaf keyshare missing"))?;
        let application = self.verify_leaf_tweak(&leaf, &keyshare, tweak)?;

        let successor = SigningKeyshare {
            id: successor_id.clone(),
            status: KeyshareStatus::InUse,
            secret_share: application.new_secret_share,
            public_shares: application.new_public_shares,
            public_key: application.new_public_key,
            min_signers: keyshare.min_signers,
            coordinator_index: keyshare.coordinator_index,
        };
        self.stores().keyshares.rotate(&leaf.keyshare_id, successor)?;
        self.stores().leaves.rotate_keyshare(&tweak.leaf_id, &successor_id)?;
        self.stores().leaves.set_owner(
            &tweak.leaf_id,
            transfer.receiver_identity,
            application.new_owner_signing_pubkey,
        )?;
        self.stores()
            .leaves
            .update_status(&tweak.leaf_id, TreeNodeStatus::Available)?;

        if !receiver_side {
            // The pending refunds become the leaf's current generation.
            let state = transfer
                .leaf(&tweak.leaf_id)
                .ok_or(OperatorError::Internal("transfer leaf state missing"))?;
            self.stores().leaves.update_refund_txs(
                &tweak.leaf_id,
                state.pending_cpfp_refund_tx.clone(),
                state.pending_direct_refund_tx.clone(),
                state.pending_direct_from_cpfp_refund_tx.clone(),
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Claim settlement
// ---------------------------------------------------------------------------

impl OperatorNode {
    /// Persist the receiver's verified refund transactions and
    /// signatures, completing the transfer on this operator.
    pub fn handle_settle_claim(
        &self,
        request: internal::SettleClaimInternal,
    ) -> Result<(), OperatorError> {
        let transfer = self
            .stores()
            .transfers
            .get(&request.transfer_id)
            .map_err(|_| OperatorError::NotFound("transfer not found"))?;
        if transfer.status == TransferStatus::Completed {
            return Ok(());
        }
        if !matches!(
            transfer.status,
            TransferStatus::ReceiverKeyTweaked | TransferStatus::ReceiverRefundSigned
        ) {
            return Err(OperatorError::FailedPrecondition("claim is not ready to settle"));
        }
        if request.leaves.len() != transfer.leaves.len() {
            return Err(OperatorError::InvalidArgument("settlement must cover every leaf"));
        }

        // Verify everything before persisting anything.
        for settle in &request.leaves {
            if transfer.leaf(&settle.leaf_id).is_none() {
                return Err(OperatorError::InvalidArgument("settlement names a leaf outside the transfer"));
            }
            let leaf = self
                .stores()
                .leaves
                .get(&settle.leaf_id)
                .map_err(|_| OperatorError::NotFound("unknown leaf"))?;
            let signature = settle
                .signature
                .as_ref()
                .ok_or(OperatorError::InvalidArgument("missing refund signature"))?;

            let sighash = refund_sighash(&leaf.node_tx, leaf.vout, &settle.cpfp_refund_tx)?;
            verify_refund_signature(&leaf.verifying_pubkey, &sighash, &signature.cpfp_signature)?;
            if !settle.direct_from_cpfp_refund_tx.is_empty() {
                let sighash =
                    refund_sighash(&leaf.node_tx, leaf.vout, &settle.direct_from_cpfp_refund_tx)?;
                verify_refund_signature(
                    &leaf.verifying_pubkey,
                    &sighash,
                    &signature.direct_from_cpfp_signature,
                )?;
            }
            if !settle.direct_refund_tx.is_empty() {
                let direct_tx = leaf
                    .direct_tx
                    .as_ref()
                    .ok_or(OperatorError::InvalidArgument("leaf has no direct tx"))?;
                let sighash = refund_sighash(direct_tx, 0, &settle.direct_refund_tx)?;
                verify_refund_signature(&leaf.verifying_pubkey, &sighash, &signature.direct_signature)?;
            }
        }

        for settle in &request.leaves {
            self.stores().leaves.update_refund_txs(
                &settle.leaf_id,
                settle.cpfp_refund_tx.to_vec(),
                (!settle.direct_refund_tx.is_empty()).then(|| settle.direct_refund_tx.to_vec()),
                (!settle.direct_from_cpfp_refund_tx.is_empty())
                    .then(|| settle.direct_from_cpfp_refund_tx.to_vec()),
            )?;
            self.stores()
                .leaves
                .update_status(&settle.leaf_id, TreeNodeStatus::Available)?;
        }

        let leaves = request.leaves.clone();
        self.stores().transfers.update(&request.transfer_id, &mut |row| {
            for settle in &leaves {
                let Some(leaf) = row.leaves.iter_mut().find(|l| l.leaf_id == settle.leaf_id) else {
                    continue;
                };
                leaf.pending_cpfp_refund_tx = settle.cpfp_refund_tx.to_vec();
                if !settle.direct_refund_tx.is_empty() {
                    leaf.pending_direct_refund_tx = Some(settle.direct_refund_tx.to_vec());
                }
                if !settle.direct_from_cpfp_refund_tx.is_empty() {
                    leaf.pending_direct_from_cpfp_refund_tx =
                        Some(settle.direct_from_cpfp_refund_tx.to_vec());
                }
                if let Some(sig) = &settle.signature {
                    leaf.cpfp_refund_signature = Some(sig.cpfp_signature.to_vec());
                    if !sig.direct_signature.is_empty() {
                        leaf.direct_refund_signature = Some(sig.direct_signature.to_vec());
                    }
                    if !sig.direct_from_cpfp_signature.is_empty() {
                        leaf.direct_from_cpfp_refund_signature =
                            Some(sig.direct_from_cpfp_signature.to_vec());
                    }
                }
            }
            Ok(())
        })?;

        self.stores().transfers.compare_and_swap_status(
            &request.transfer_id,
            &[TransferStatus::ReceiverKeyTweaked, TransferStatus::ReceiverRefundSigned],
            TransferStatus::Completed,
        )?;

        self.journal(&request.transfer_id, JournalEvent::RefundsFinalized);
        tracing::info!(operator = self.id(), transfer_id = %request.transfer_id, "claim settled");
        Ok(())
    }

    /// Expire pre-tweak transfers past their deadline, releasing leaf
    /// locks. Each operator sweeps on its own clock; the outcome matches
    /// a sender cancellation.
    pub fn expire_transfers(&self, now: u64) -> Result<usize, OperatorError> {
        let expirable = self.stores().transfers.expirable(now)?;
        let mut expired = 0;
        for transfer in expirable {
            match self.handle_rollback_transfer(internal::RollbackTransferInternal {
                transfer_id: transfer.id.clone(),
                expired: true,
            }) {
                Ok(()) => expired += 1,
                Err(e) => {
                    tracing::warn!(operator = self.id(), transfer_id = %transfer.id, %e, "expiry failed");
                }
            }
        }
        Ok(expired)
    }

    /// Record a revealed preimage, unblocking preimage-gated claims.
    pub fn reveal_preimage(&self, transfer_id: &str, preimage: &[u8; 32]) -> Result<(), OperatorError> {
        use bitcoin::hashes::{sha256, Hash};
        let transfer = self
            .stores()
            .transfers
            .get(transfer_id)
            .map_err(|_| OperatorError::NotFound("transfer not found"))?;
        let Some(payment_hash) = transfer.payment_hash else {
            return Err(OperatorError::FailedPrecondition("transfer is not preimage-gated"));
        };
        if sha256::Hash::hash(preimage).to_byte_array() != payment_hash {
            return Err(OperatorError::InvalidArgument("preimage does not match the payment hash"));
        }
        self.stores().transfers.update(transfer_id, &mut |row| {
            row.preimage_revealed = true;
            Ok(())
        })?;
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push(HEX[(b >> 4) as usize] as char);
        s.push(HEX[(b & 0x0F) as usize] as char);
    }
    s
}

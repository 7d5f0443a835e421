//! The two-round FROST signing ceremony.
//!
//! Signing a refund transaction involves the signing operators plus the
//! leaf owner (the "user") in a nested group:
//!
//! 1. **Commit round.** The coordinator picks a signing set of at least
//!    `min_signers` operators (itself included). Each member reserves a
//!    nonce pair per job in its pool and returns the commitment half.
//! 2. **Sign round.** The coordinator broadcasts `(message, commitment
//!    set, signing set)` per job. Each member consumes its pooled nonce
//!    by commitment and returns a partial signature.
//!
//! When the user pre-signed against previously reserved commitments, the
//! commit round is skipped and the coordinator aggregates everything into
//! a final BIP-340 signature server-side; otherwise the operator material
//! is returned for client-side aggregation.
//!
//! Failure rules: a commit-round failure re-picks the signing set without
//! the failed operator (while `min_signers` remains satisfiable); a
//! sign-round failure abandons the session and restarts from commit with
//! fresh nonces. Nonces consumed by successful partials are never reused.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bitcoin::secp256k1::{PublicKey, SecretKey};
use bytes::Bytes;
use frost_secp256k1_tr::round1::SigningCommitments;
use frost_secp256k1_tr::round2::SignatureShare;
use tokio::task::JoinSet;

use spark_crypto::frost;
use storage::nonce::NonceEntry;
use transport::internal;
use transport::rpc::{FollowerClient, RpcError};
use transport::spark;

use crate::coordinator::Coordinator;
use crate::error::OperatorError;
use crate::{generate_uuid, OperatorNode};

/// Ceremony restarts before giving up (commit re-picks excluded).
const MAX_SIGN_RESTARTS: usize = 2;

// ---------------------------------------------------------------------------
// Job types
// ---------------------------------------------------------------------------

/// Which refund variant a job signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefundVariant {
    Cpfp,
    Direct,
    DirectFromCpfp,
}

/// One signing session: a leaf × refund-variant pair.
#[derive(Clone)]
pub(crate) struct SigningJobSpec {
    pub job_id: String,
    pub leaf_id: String,
    pub variant: RefundVariant,
    pub keyshare_id: String,
    /// The 32-byte sighash being signed.
    pub message: [u8; 32],
    pub verifying_pubkey: [u8; 33],
    /// The owner signing key participating as the user.
    pub user_pubkey: [u8; 33],
    pub user_commitment: SigningCommitments,
    /// The user's partial signature, when pre-signed.
    pub user_partial: Option<SignatureShare>,
    /// Operator commitments the user pre-signed against (by federation
    /// index). `Some` selects the skip-commit-round path.
    pub preset_commitments: Option<BTreeMap<u16, SigningCommitments>>,
}

impl SigningJobSpec {
    pub fn new(
        leaf_id: &str,
        variant: RefundVariant,
        keyshare_id: &str,
        message: [u8; 32],
        verifying_pubkey: [u8; 33],
        user_pubkey: [u8; 33],
        user_commitment: SigningCommitments,
    ) -> Self {
        Self {
            job_id: generate_uuid(),
            leaf_id: leaf_id.to_owned(),
            variant,
            keyshare_id: keyshare_id.to_owned(),
            message,
            verifying_pubkey,
            user_pubkey,
            user_commitment,
            user_partial: None,
            preset_commitments: None,
        }
    }
}

/// Outcome of one signing session.
pub(crate) struct SignedJobResult {
    pub leaf_id: String,
    pub variant: RefundVariant,
    pub verifying_pubkey: [u8; 33],
    pub operator_commitments: BTreeMap<u16, SigningCommitments>,
    /// Serialized partial signatures by federation index.
    pub operator_shares: BTreeMap<u16, Vec<u8>>,
    /// Operator verifying shares by federation index.
    pub operator_public_shares: BTreeMap<u16, [u8; 33]>,
    /// Aggregated 64-byte signature, when the user partial was supplied.
    pub final_signature: Option<Vec<u8>>,
}

impl SignedJobResult {
    /// Wire form keyed by operator id.
    pub fn to_proto(&self, config: &config::FederationConfig) -> spark::SigningResultProto {
        let mut signing_commitments = HashMap::new();
        let mut signature_shares = HashMap::new();
        let mut public_shares = HashMap::new();
        for (index, commitment) in &self.operator_commitments {
            let Some(op) = config.operator_by_index(*index) else {
                continue;
            };
            if let Ok(proto) = commitment_to_proto(commitment) {
                signing_commitments.insert(op.id.clone(), proto);
            }
            if let Some(share) = self.operator_shares.get(index) {
                signature_shares.insert(op.id.clone(), Bytes::copy_from_slice(share));
            }
            if let Some(pk) = self.operator_public_shares.get(index) {
                public_shares.insert(op.id.clone(), Bytes::copy_from_slice(pk));
            }
        }
        spark::SigningResultProto {
            signing_commitments,
            signature_shares,
            public_shares,
            final_signature: self
                .final_signature
                .as_ref()
                .map(|s| Bytes::copy_from_slice(s))
                .unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Proto conversions
// ---------------------------------------------------------------------------

pub(crate) fn commitment_to_proto(
    commitment: &SigningCommitments,
) -> Result<spark::SigningCommitmentProto, OperatorError> {
    let (hiding, binding) = frost::commitment_components(commitment)?;
    Ok(spark::SigningCommitmentProto {
        hiding: Bytes::from(hiding),
        binding: Bytes::from(binding),
    })
}

pub(crate) fn commitment_from_proto(
    proto: &spark::SigningCommitmentProto,
) -> Result<SigningCommitments, OperatorError> {
    frost::commitment_from_components(&proto.hiding, &proto.binding)
        .map_err(|_| OperatorError::InvalidArgument("malformed signing commitment"))
}

// ---------------------------------------------------------------------------
// Follower handlers
// ---------------------------------------------------------------------------

impl OperatorNode {
    /// Commit round: reserve one fresh nonce pair per job and return the
    /// commitments. Nonces stay in the pool until the sign round consumes
    /// them by commitment.
    pub fn handle_frost_commit(
        &self,
        request: internal::FrostCommitRequest,
    ) -> Result<internal::FrostCommitResponse, OperatorError> {
        let mut rng = rand::thread_rng();
        let mut commitments = Vec::with_capacity(request.jobs.len());

        for job in &request.jobs {
            let keyshare = self.stores().keyshares.get(&job.keyshare_id).map_err(|_| {
                OperatorError::NotFound("unknown keyshare for signing job")
            })?;
            if keyshare.status == storage::keyshare::KeyshareStatus::Retired {
                return Err(OperatorError::FailedPrecondition("keyshare retired"));
            }

            let share = frost::signing_share_from_bytes(&keyshare.secret_share)
                .map_err(|_| OperatorError::Internal("corrupt keyshare"))?;
            let pair = frost::generate_nonce_pair(&share, &mut rng);

            let commitment_bytes = frost::commitment_to_binary(&pair.commitment)?;
            self.stores().nonces.insert(NonceEntry {
                commitment: commitment_bytes,
                keyshare_id: job.keyshare_id.clone(),
                nonces: frost::nonces_to_bytes(&pair.nonces)?,
            })?;

            commitments.push(internal::JobCommitment {
                job_id: job.job_id.clone(),
                commitment: Some(commitment_to_proto(&pair.commitment)?),
            });
        }

        Ok(internal::FrostCommitResponse { commitments })
    }

    /// Sign round: consume the pooled nonce identified by
    /// `self_commitment` and produce a partial signature bound to the
    /// full commitment set. Consumption is single-use; replaying a job
    /// whose nonce is gone fails.
    pub fn handle_frost_sign(
        &self,
        request: internal::FrostSignRequest,
    ) -> Result<internal::FrostSignResponse, OperatorError> {
        let self_id = self.id().to_owned();
        let mut results = Vec::with_capacity(request.jobs.len());

        for job in &request.jobs {
            let self_commitment_proto = job
                .self_commitment
                .as_ref()
                .ok_or(OperatorError::InvalidArgument("missing self commitment"))?;
            let self_commitment = commitment_from_proto(self_commitment_proto)?;
            let commitment_bytes = frost::commitment_to_binary(&self_commitment)?;

            let entry = self
                .stores()
                .nonces
                .consume(&commitment_bytes)
                .map_err(|_| OperatorError::NotFound("nonce commitment unknown or consumed"))?;
            if entry.keyshare_id != job.keyshare_id {
                return Err(OperatorError::InvalidArgument(
                    "nonce was reserved for a different keyshare",
                ));
            }
            let nonces = frost::nonces_from_bytes(&entry.nonces)
                .map_err(|_| OperatorError::Internal("corrupt pooled nonce"))?;

            let keyshare = self
                .stores()
                .keyshares
                .get(&job.keyshare_id)
                .map_err(|_| OperatorError::NotFound("unknown keyshare for signing job"))?;
            if keyshare.status == storage::keyshare::KeyshareStatus::Retired {
                return Err(OperatorError::FailedPrecondition("keyshare retired"));
            }

            let mut commitments = BTreeMap::new();
            for participant in &job.operator_commitments {
                let proto = participant
                    .commitment
                    .as_ref()
                    .ok_or(OperatorError::InvalidArgument("missing participant commitment"))?;
                let identifier = frost::operator_identifier(participant.operator_index as u16)
                    .map_err(|_| OperatorError::InvalidArgument("bad operator index"))?;
                commitments.insert(identifier, commitment_from_proto(proto)?);
            }
            let user_proto = job
                .user_commitment
                .as_ref()
                .ok_or(OperatorError::InvalidArgument("missing user commitment"))?;
            commitments.insert(frost::user_identifier(), commitment_from_proto(user_proto)?);

            let message: [u8; 32] = job
                .message
                .as_ref()
                .try_into()
                .map_err(|_| OperatorError::InvalidArgument("message must be 32 bytes"))?;
            let verifying = PublicKey::from_slice(&job.verifying_pubkey)
                .map_err(|_| OperatorError::InvalidArgument("bad verifying key"))?;
            let share_secret = SecretKey::from_slice(&keyshare.secret_share)
                .map_err(|_| OperatorError::Internal("corrupt keyshare"))?;
            let share_public = keyshare
                .public_shares
                .get(&self_id)
                .and_then(|pk| PublicKey::from_slice(pk).ok())
                .ok_or(OperatorError::Internal("missing own public share"))?;

            let partial = frost::sign_as_operator(
                &message,
                &share_secret,
                &share_public,
                &verifying,
                frost::operator_identifier(self.self_index())
                    .map_err(|_| OperatorError::Internal("bad self index"))?,
                &nonces,
                &commitments,
            )
            .map_err(|_| OperatorError::Internal("partial signature failed"))?;

            results.push(internal::JobSignatureShare {
                job_id: job.job_id.clone(),
                signature_share: Bytes::from(frost::signature_share_to_bytes(&partial)),
            });
        }

        Ok(internal::FrostSignResponse { results })
    }
}

// ---------------------------------------------------------------------------
// Coordinator-side ceremony
// ---------------------------------------------------------------------------

/// Why a ceremony attempt failed.
enum AttemptError {
    /// A specific member failed the commit round; exclude and re-pick.
    CommitFailed(u16, RpcError),
    /// The sign round failed; restart from commit with fresh nonces.
    SignFailed(OperatorError),
    /// Not retryable.
    Fatal(OperatorError),
}

impl<C: FollowerClient + 'static> Coordinator<C> {
    /// Run the full ceremony for a batch of jobs, all sharing one signing
    /// set. Returns one result per job, in input order.
    pub(crate) async fn run_signing_ceremony(
        &self,
        specs: &[SigningJobSpec],
    ) -> Result<Vec<SignedJobResult>, OperatorError> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        // Pre-signed path: the user already fixed the commitment set.
        if specs.iter().all(|s| s.preset_commitments.is_some()) {
            let per_job: Vec<BTreeMap<u16, SigningCommitments>> = specs
                .iter()
                .map(|s| s.preset_commitments.clone().expect("checked above"))
                .collect();
            let members: BTreeSet<u16> = per_job[0].keys().copied().collect();
            if members.len() < self.node.config().min_signers {
                return Err(OperatorError::InvalidArgument(
                    "too few operator commitments for the threshold",
                ));
            }
            if per_job.iter().any(|m| m.keys().copied().collect::<BTreeSet<u16>>() != members) {
                return Err(OperatorError::InvalidArgument(
                    "signing jobs disagree on the signing set",
                ));
            }
            // No re-pick is possible here: the user's partials are bound
            // to this exact commitment set.
            return self.sign_round(specs, &members, &per_job).await.map_err(|e| match e {
                AttemptError::Fatal(err) => err,
                AttemptError::CommitFailed(..) | AttemptError::SignFailed(_) => {
                    OperatorError::Aborted("signing session failed; retry with fresh commitments")
                }
            });
        }
        if specs.iter().any(|s| s.preset_commitments.is_some()) {
            return Err(OperatorError::InvalidArgument(
                "signing jobs mix preset and fresh commitments",
            ));
        }

        let mut excluded: BTreeSet<u16> = BTreeSet::new();
        let mut restarts = 0;
        loop {
            let members = self.pick_signing_set(&excluded)?;
            tracing::debug!(
                operator = self.node.id(),
                ?members,
                jobs = specs.len(),
                "starting signing ceremony attempt"
            );

            let per_job = match self.commit_round(specs, &members).await {
                Ok(commitments) => commitments,
                Err(AttemptError::CommitFailed(index, e)) => {
                    tracing::warn!(operator_index = index, %e, "commit round failed; re-picking signing set");
                    excluded.insert(index);
                    continue;
                }
                Err(AttemptError::SignFailed(e)) | Err(AttemptError::Fatal(e)) => return Err(e),
            };

            match self.sign_round(specs, &members, &per_job).await {
                Ok(results) => return Ok(results),
                Err(AttemptError::SignFailed(e)) => {
                    if restarts >= MAX_SIGN_RESTARTS {
                        return Err(OperatorError::Aborted("signing ceremony failed after retries"));
                    }
                    restarts += 1;
                    tracing::warn!(%e, restarts, "sign round failed; restarting from commit");
                }
                Err(AttemptError::CommitFailed(index, _)) => {
                    excluded.insert(index);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
            }
        }
    }

    /// The signing set: this operator plus the lowest non-excluded
    /// indices, `min_signers` in total.
    fn pick_signing_set(&self, excluded: &BTreeSet<u16>) -> Result<BTreeSet<u16>, OperatorError> {
        let config = self.node.config();
        let self_index = self.node.self_index();
        if excluded.contains(&self_index) {
            return Err(OperatorError::Internal("coordinator excluded from signing"));
        }
        let mut members = BTreeSet::from([self_index]);
        for op in config.operators() {
            if members.len() >= config.min_signers {
                break;
            }
            if !excluded.contains(&op.index) {
                members.insert(op.index);
            }
        }
        if members.len() < config.min_signers {
            return Err(OperatorError::Aborted(
                "not enough healthy operators for the signing threshold",
            ));
        }
        Ok(members)
    }

    /// Fan the commit round to every member; returns per-job commitment
    /// maps keyed by federation index.
    async fn commit_round(
        &self,
        specs: &[SigningJobSpec],
        members: &BTreeSet<u16>,
    ) -> Result<Vec<BTreeMap<u16, SigningCommitments>>, AttemptError> {
        let request = internal::FrostCommitRequest {
            jobs: specs
                .iter()
                .map(|s| internal::FrostCommitJob {
                    job_id: s.job_id.clone(),
                    keyshare_id: s.keyshare_id.clone(),
                })
                .collect(),
        };

        let mut responses: HashMap<u16, internal::FrostCommitResponse> = HashMap::new();

        // Local reservation first: a coordinator that cannot commit has no
        // business re-picking followers.
        let self_index = self.node.self_index();
        let local = self
            .node
            .handle_frost_commit(request.clone())
            .map_err(AttemptError::Fatal)?;
        responses.insert(self_index, local);

        let mut set = JoinSet::new();
        for index in members {
            if *index == self_index {
                continue;
            }
            let Some(op) = self.node.config().operator_by_index(*index) else {
                return Err(AttemptError::Fatal(OperatorError::Internal("bad member index")));
            };
            let client = Arc::clone(&self.client);
            let op_id = op.id.clone();
            let idx = *index;
            let request = request.clone();
            set.spawn(async move { (idx, client.frost_commit(&op_id, request).await) });
        }

        while let Some(joined) = set.join_next().await {
            let (index, result) =
                joined.map_err(|_| AttemptError::Fatal(OperatorError::Internal("join failed")))?;
            match result {
                Ok(response) => {
                    responses.insert(index, response);
                }
                Err(e) => return Err(AttemptError::CommitFailed(index, e)),
            }
        }

        // Reassemble per job, deterministically ordered by index.
        let mut per_job = vec![BTreeMap::new(); specs.len()];
        for (index, response) in &responses {
            let by_job: HashMap<&str, &internal::JobCommitment> = response
                .commitments
                .iter()
                .map(|c| (c.job_id.as_str(), c))
                .collect();
            for (i, spec) in specs.iter().enumerate() {
                let commitment = by_job
                    .get(spec.job_id.as_str())
                    .and_then(|c| c.commitment.as_ref())
                    .ok_or(AttemptError::Fatal(OperatorError::Internal(
                        "member omitted a job commitment",
                    )))?;
                per_job[i].insert(
                    *index,
                    commitment_from_proto(commitment).map_err(AttemptError::Fatal)?,
                );
            }
        }
        Ok(per_job)
    }

    /// Fan the sign round to every member and assemble results.
    async fn sign_round(
        &self,
        specs: &[SigningJobSpec],
        members: &BTreeSet<u16>,
        per_job: &[BTreeMap<u16, SigningCommitments>],
    ) -> Result<Vec<SignedJobResult>, AttemptError> {
        let self_index = self.node.self_index();

        // Per-member request: the member's own commitment identifies the
        // pooled nonce it must consume.
        let mut requests: HashMap<u16, internal::FrostSignRequest> = HashMap::new();
        for index in members {
            let mut jobs = Vec::with_capacity(specs.len());
            for (i, spec) in specs.iter().enumerate() {
                let commitments = &per_job[i];
                let self_commitment = commitments.get(index).ok_or(AttemptError::Fatal(
                    OperatorError::Internal("member missing from commitment set"),
                ))?;
                let mut operator_commitments = Vec::with_capacity(commitments.len());
                for (idx, commitment) in commitments {
                    operator_commitments.push(internal::ParticipantCommitment {
                        operator_index: u32::from(*idx),
                        commitment: Some(
                            commitment_to_proto(commitment).map_err(AttemptError::Fatal)?,
                        ),
                    });
                }
                jobs.push(internal::FrostSignJob {
                    job_id: spec.job_id.clone(),
                    keyshare_id: spec.keyshare_id.clone(),
                    message: Bytes::copy_from_slice(&spec.message),
                    verifying_pubkey: Bytes::copy_from_slice(&spec.verifying_pubkey),
                    operator_commitments,
                    user_commitment: Some(
                        commitment_to_proto(&spec.user_commitment).map_err(AttemptError::Fatal)?,
                    ),
                    self_commitment: Some(
                        commitment_to_proto(self_commitment).map_err(AttemptError::Fatal)?,
                    ),
                });
            }
            requests.insert(*index, internal::FrostSignRequest { jobs });
        }

        let mut shares_by_member: HashMap<u16, internal::FrostSignResponse> = HashMap::new();

        if members.contains(&self_index) {
            let request = requests
                .remove(&self_index)
                .expect("self request built above");
            let response = self
                .node
                .handle_frost_sign(request)
                .map_err(|e| AttemptError::SignFailed(e))?;
            shares_by_member.insert(self_index, response);
        }

        let mut set = JoinSet::new();
        for (index, request) in requests {
            let Some(op) = self.node.config().operator_by_index(index) else {
                return Err(AttemptError::Fatal(OperatorError::Internal("bad member index")));
            };
            let client = Arc::clone(&self.client);
            let op_id = op.id.clone();
            set.spawn(async move { (index, client.frost_sign(&op_id, request).await) });
        }
        while let Some(joined) = set.join_next().await {
            let (index, result) =
                joined.map_err(|_| AttemptError::Fatal(OperatorError::Internal("join failed")))?;
            match result {
                Ok(response) => {
                    shares_by_member.insert(index, response);
                }
                Err(e) => {
                    tracing::warn!(operator_index = index, %e, "sign round member failure");
                    return Err(AttemptError::SignFailed(e.into()));
                }
            }
        }

        // Assemble per-job results; operator responses may arrive in any
        // order, the BTreeMaps sort by index before any aggregation.
        let mut results = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let keyshare = self
                .node
                .stores()
                .keyshares
                .get(&spec.keyshare_id)
                .map_err(|e| AttemptError::Fatal(e.into()))?;

            let mut operator_shares: BTreeMap<u16, Vec<u8>> = BTreeMap::new();
            for (index, response) in &shares_by_member {
                let share = response
                    .results
                    .iter()
                    .find(|r| r.job_id == spec.job_id)
                    .ok_or(AttemptError::Fatal(OperatorError::Internal(
                        "member omitted a job signature",
                    )))?;
                operator_shares.insert(*index, share.signature_share.to_vec());
            }

            let mut operator_public_shares: BTreeMap<u16, [u8; 33]> = BTreeMap::new();
            for index in members {
                let Some(op) = self.node.config().operator_by_index(*index) else {
                    continue;
                };
                if let Some(pk) = keyshare.public_shares.get(&op.id) {
                    operator_public_shares.insert(*index, *pk);
                }
            }

            let final_signature = match &spec.user_partial {
                Some(user_partial) => Some(
                    aggregate_with_user(
                        spec,
                        &per_job[i],
                        &operator_shares,
                        &operator_public_shares,
                        user_partial,
                        self.node.config(),
                    )
                    .map_err(AttemptError::Fatal)?,
                ),
                None => None,
            };

            results.push(SignedJobResult {
                leaf_id: spec.leaf_id.clone(),
                variant: spec.variant,
                verifying_pubkey: spec.verifying_pubkey,
                operator_commitments: per_job[i].clone(),
                operator_shares,
                operator_public_shares,
                final_signature,
            });
        }
        Ok(results)
    }
}

/// Aggregate operator partials with the user's into one BIP-340
/// signature, then verify it under the Taproot-tweaked verifying key
/// before trusting it.
fn aggregate_with_user(
    spec: &SigningJobSpec,
    commitments: &BTreeMap<u16, SigningCommitments>,
    operator_shares: &BTreeMap<u16, Vec<u8>>,
    operator_public_shares: &BTreeMap<u16, [u8; 33]>,
    user_partial: &SignatureShare,
    _config: &config::FederationConfig,
) -> Result<Vec<u8>, OperatorError> {
    let mut all_commitments = BTreeMap::new();
    let mut all_shares = BTreeMap::new();
    let mut verifying_shares = BTreeMap::new();

    for (index, commitment) in commitments {
        let identifier = frost::operator_identifier(*index)
            .map_err(|_| OperatorError::Internal("bad operator index"))?;
        all_commitments.insert(identifier, commitment.clone());

        let share_bytes = operator_shares
            .get(index)
            .ok_or(OperatorError::Internal("missing operator partial"))?;
        all_shares.insert(
            identifier,
            frost::signature_share_from_bytes(share_bytes)
                .map_err(|_| OperatorError::Internal("malformed partial signature"))?,
        );

        let pk_bytes = operator_public_shares
            .get(index)
            .ok_or(OperatorError::Internal("missing operator public share"))?;
        verifying_shares.insert(
            identifier,
            PublicKey::from_slice(pk_bytes).map_err(|_| OperatorError::Internal("bad public share"))?,
        );
    }

    let user = frost::user_identifier();
    all_commitments.insert(user, spec.user_commitment.clone());
    all_shares.insert(user, user_partial.clone());
    verifying_shares.insert(
        user,
        PublicKey::from_slice(&spec.user_pubkey)
            .map_err(|_| OperatorError::InvalidArgument("bad user signing key"))?,
    );

    let verifying = PublicKey::from_slice(&spec.verifying_pubkey)
        .map_err(|_| OperatorError::InvalidArgument("bad verifying key"))?;

    let signature = frost::aggregate(
        &spec.message,
        all_commitments,
        &all_shares,
        &verifying_shares,
        &verifying,
    )
    .map_err(|_| OperatorError::InvalidArgument("partial signatures failed to aggregate"))?;

    let bytes = frost::signature_to_bytes(&signature)
        .map_err(|_| OperatorError::Internal("signature serialization failed"))?;
    crate::bitcoin_tx::verify_refund_signature(&spec.verifying_pubkey, &spec.message, &bytes)
        .map_err(|_| OperatorError::InvalidArgument("aggregated signature failed verification"))?;
    Ok(bytes)
}

//! Multi-operator transfer scenarios against an in-process federation.

use bytes::Bytes;

use config::constants::{INITIAL_TIMELOCK, TIMELOCK_INTERVAL};
use operator::bitcoin_tx::{sequence_of, timelock_of};
use operator::cluster::{Fault, LocalCluster};
use operator::OperatorError;
use storage::transfer::{TransferStatus, TransferType};
use transport::spark;
use wallet_sim::SimWallet;

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn pending_request(wallet: &SimWallet) -> spark::QueryPendingTransfersRequest {
    spark::QueryPendingTransfersRequest {
        receiver_identity_pubkey: Bytes::copy_from_slice(&wallet.identity()),
        network: config::Network::Regtest.to_proto(),
    }
}

fn owned_value(cluster: &LocalCluster, node: usize, wallet: &SimWallet) -> u64 {
    cluster.nodes[node]
        .stores()
        .leaves
        .query_by_owner(&wallet.identity())
        .unwrap()
        .iter()
        .map(|l| l.value)
        .sum()
}

/// Full happy path: initiate, co-sign, tweak, query, claim.
#[tokio::test]
async fn transfer_end_to_end() {
    let cluster = LocalCluster::new(5, 3);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 100_000);

    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 600)
        .await
        .unwrap();
    let response = coordinator.start_transfer(prepared.request.clone()).await.unwrap();

    let transfer = response.transfer.unwrap();
    assert_eq!(transfer.id, prepared.transfer_id);
    assert_eq!(transfer.status, TransferStatus::SenderKeyTweakPending.to_proto());
    assert_eq!(response.signing_results.len(), 1);
    // Pre-signed flow: the coordinator aggregated final signatures.
    let cpfp_result = response.signing_results[0].cpfp.as_ref().unwrap();
    assert_eq!(cpfp_result.final_signature.len(), 64);

    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .unwrap();

    // Receiver sees exactly one pending transfer, with the sender's id.
    let pending = coordinator.query_pending_transfers(pending_request(&bob)).unwrap();
    assert_eq!(pending.transfers.len(), 1);
    let pending_transfer = &pending.transfers[0];
    assert_eq!(pending_transfer.id, prepared.transfer_id);
    assert_eq!(pending_transfer.transfer_type, TransferType::Transfer.to_proto());
    assert_eq!(pending_transfer.status, TransferStatus::SenderKeyTweaked.to_proto());

    // The sender has nothing pending.
    assert!(coordinator.query_pending_transfers(pending_request(&alice)).unwrap().transfers.is_empty());

    wallet_sim::claim_transfer(&coordinator, &bob, pending_transfer)
        .await
        .unwrap();

    // Every operator agrees: one 100 000-sat leaf under Bob, none under Alice.
    for node in 0..5 {
        assert_eq!(owned_value(&cluster, node, &bob), 100_000, "node {node}");
        assert_eq!(owned_value(&cluster, node, &alice), 0, "node {node}");
    }
    let row = cluster.nodes[0].stores().transfers.get(&prepared.transfer_id).unwrap();
    assert_eq!(row.status, TransferStatus::Completed);

    // The new generation's refund timelock moved down exactly one interval,
    // and the claim re-sign preserved it.
    let claimed = cluster.nodes[0].stores().leaves.get(&leaf).unwrap();
    let sequence = sequence_of(claimed.refund_tx.as_ref().unwrap()).unwrap();
    assert_eq!(timelock_of(sequence), INITIAL_TIMELOCK - TIMELOCK_INTERVAL);
}

/// A transfer with no leaves is rejected outright.
#[tokio::test]
async fn zero_leaf_transfer_rejected() {
    let cluster = LocalCluster::new(3, 2);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let request = spark::InitiateTransferRequest {
        transfer_id: "2c3e0597-6af5-4a25-a5cd-0b104ba87b1c".into(),
        transfer_type: TransferType::Transfer.to_proto(),
        expiry_time: Some(::prost_types::Timestamp {
            seconds: (now() + 600) as i64,
            nanos: 0,
        }),
        sender_identity_pubkey: Bytes::copy_from_slice(&alice.identity()),
        receiver_identity_pubkey: Bytes::copy_from_slice(&bob.identity()),
        network: config::Network::Regtest.to_proto(),
        leaves: Vec::new(),
        payment_hash: Bytes::new(),
    };

    let err = coordinator.start_transfer(request).await.unwrap_err();
    assert!(matches!(err, OperatorError::InvalidArgument(_)), "{err}");
}

/// Cancelling before the key tweak releases the leaf on every operator,
/// and the leaf can be sent again afterwards.
#[tokio::test]
async fn cancel_before_tweak() {
    let cluster = LocalCluster::new(5, 3);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 100_000);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 2)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();

    // No need to wait for expiry: the key was never tweaked.
    let cancelled = coordinator
        .cancel_transfer(spark::CancelTransferRequest {
            transfer_id: prepared.transfer_id.clone(),
            sender_identity_pubkey: Bytes::copy_from_slice(&alice.identity()),
        })
        .await
        .unwrap();
    assert_eq!(
        cancelled.transfer.unwrap().status,
        TransferStatus::Cancelled.to_proto()
    );

    // History shows the cancelled transfer on every operator.
    for index in 0..5 {
        let history = cluster
            .coordinator(index)
            .query_all_transfers(spark::QueryAllTransfersRequest {
                identity_pubkey: Bytes::copy_from_slice(&alice.identity()),
                limit: 10,
                offset: 0,
                types: Vec::new(),
            })
            .unwrap();
        assert_eq!(history.transfers.len(), 1, "node {index}");
        assert_eq!(
            history.transfers[0].status,
            TransferStatus::Cancelled.to_proto(),
            "node {index}"
        );
        assert_eq!(owned_value(&cluster, index, &alice), 100_000, "node {index}");
    }

    // The leaf transfers cleanly on the next attempt.
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 600)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .unwrap();
    let pending = coordinator.query_pending_transfers(pending_request(&bob)).unwrap();
    wallet_sim::claim_transfer(&coordinator, &bob, &pending.transfers[0])
        .await
        .unwrap();
    assert_eq!(owned_value(&cluster, 0, &bob), 100_000);
}

/// After the sender tweaks, cancellation is refused -- even past expiry.
#[tokio::test]
async fn cancel_after_tweak_refused() {
    let cluster = LocalCluster::new(5, 3);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 100_000);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 1)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let err = coordinator
        .cancel_transfer(spark::CancelTransferRequest {
            transfer_id: prepared.transfer_id.clone(),
            sender_identity_pubkey: Bytes::copy_from_slice(&alice.identity()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OperatorError::FailedPrecondition(_)), "{err}");

    // The expiry sweep must not touch it either.
    assert_eq!(cluster.nodes[0].expire_transfers(now() + 100).unwrap(), 0);
}

/// Expired pre-tweak transfers are swept back to the sender.
#[tokio::test]
async fn expiry_sweep_releases_leaves() {
    let cluster = LocalCluster::new(3, 2);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 50_000);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 1)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();

    // Sweep on each operator once the deadline passes.
    for node in &cluster.nodes {
        assert_eq!(node.expire_transfers(now() + 5).unwrap(), 1);
    }
    let row = cluster.nodes[1].stores().transfers.get(&prepared.transfer_id).unwrap();
    assert_eq!(row.status, TransferStatus::Expired);
    assert_eq!(owned_value(&cluster, 1, &alice), 50_000);

    // Claiming an expired transfer is refused with its terminal status.
    let pending = coordinator.query_pending_transfers(pending_request(&bob)).unwrap();
    assert!(pending.transfers.is_empty());
}

/// Re-issuing the initiation returns the recorded state without
/// consuming any additional signing nonces.
#[tokio::test]
async fn start_transfer_is_idempotent() {
    let cluster = LocalCluster::new(5, 3);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 100_000);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 600)
        .await
        .unwrap();

    let first = coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    let pool_after_first: Vec<usize> = cluster
        .nodes
        .iter()
        .map(|n| n.stores().nonces.unconsumed())
        .collect();

    let second = coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    let pool_after_second: Vec<usize> = cluster
        .nodes
        .iter()
        .map(|n| n.stores().nonces.unconsumed())
        .collect();

    assert_eq!(pool_after_first, pool_after_second, "retry must not consume nonces");
    assert_eq!(
        first.transfer.as_ref().unwrap().status,
        second.transfer.as_ref().unwrap().status
    );
    assert_eq!(first.signing_results.len(), second.signing_results.len());
    assert_eq!(
        second.signing_results[0].cpfp.as_ref().unwrap().final_signature.len(),
        64
    );
}

/// Five concurrent claims: at most one wins outright, losers observe a
/// clean conflict, and exactly one leaf ends up under the receiver.
#[tokio::test]
async fn double_claim_race() {
    let cluster = LocalCluster::new(5, 3);
    let alice = SimWallet::new(1);
    let bob = std::sync::Arc::new(SimWallet::new(2));

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 100_000);
    let coordinator = cluster.coordinator(0);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 600)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .unwrap();

    let pending = coordinator.query_pending_transfers(pending_request(&bob)).unwrap();
    let transfer = pending.transfers[0].clone();

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..5 {
        let coordinator = cluster.coordinator(0);
        let bob = std::sync::Arc::clone(&bob);
        let transfer = transfer.clone();
        set.spawn(async move { wallet_sim::claim_transfer(&coordinator, &bob, &transfer).await });
    }

    let mut successes = 0;
    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined.unwrap() {
            Ok(()) => successes += 1,
            Err(e) => failures.push(e),
        }
    }

    assert!(successes >= 1, "at least one claim must succeed");
    for failure in &failures {
        assert!(
            matches!(
                failure,
                OperatorError::Conflict(_) | OperatorError::InvalidArgument(_)
            ),
            "unexpected race failure: {failure}"
        );
    }

    // A retry after the dust settles either succeeds idempotently via the
    // completed transfer or reports the lost race.
    if !failures.is_empty() {
        match wallet_sim::claim_transfer(&cluster.coordinator(0), &bob, &transfer).await {
            Ok(()) => {}
            Err(OperatorError::Conflict(_)) => {}
            Err(other) => panic!("retry must succeed or conflict, got {other}"),
        }
    }

    let bob_leaves = cluster.nodes[0]
        .stores()
        .leaves
        .query_by_owner(&bob.identity())
        .unwrap();
    assert_eq!(bob_leaves.len(), 1);
    let row = cluster.nodes[0].stores().transfers.get(&transfer.id).unwrap();
    assert_eq!(row.status, TransferStatus::Completed);
}

/// The claim steps work when driven separately, with the transfer still
/// visible as pending between them.
#[tokio::test]
async fn claim_with_separate_steps() {
    let cluster = LocalCluster::new(5, 3);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 100_000);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 600)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .unwrap();

    let pending = coordinator.query_pending_transfers(pending_request(&bob)).unwrap();
    let transfer = pending.transfers[0].clone();

    // Step 1 alone.
    let claim = wallet_sim::prepare_claim(&bob, &transfer, coordinator.node().config()).unwrap();
    coordinator
        .claim_transfer_tweak_keys(claim.tweak_request.clone())
        .await
        .unwrap();

    // Still pending (resumable), now receiver-tweaked.
    let pending = coordinator.query_pending_transfers(pending_request(&bob)).unwrap();
    assert_eq!(pending.transfers.len(), 1);
    assert_eq!(
        pending.transfers[0].status,
        TransferStatus::ReceiverKeyTweaked.to_proto()
    );

    // The composite resumes from where the separate step left off.
    wallet_sim::claim_transfer(&coordinator, &bob, &transfer).await.unwrap();
    assert_eq!(owned_value(&cluster, 0, &bob), 100_000);
}

/// Pending queries are scoped to the leaf network.
#[tokio::test]
async fn pending_query_filters_by_network() {
    let cluster = LocalCluster::new(3, 2);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 10_000);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 600)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .unwrap();

    assert_eq!(
        coordinator.query_pending_transfers(pending_request(&bob)).unwrap().transfers.len(),
        1
    );
    let mainnet = coordinator
        .query_pending_transfers(spark::QueryPendingTransfersRequest {
            receiver_identity_pubkey: Bytes::copy_from_slice(&bob.identity()),
            network: config::Network::Mainnet.to_proto(),
        })
        .unwrap();
    assert!(mainnet.transfers.is_empty());
}

/// History pagination and type filters.
#[tokio::test]
async fn query_all_transfers_paginates_and_filters() {
    let cluster = LocalCluster::new(5, 3);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    // One completed plain transfer.
    let leaf_a = wallet_sim::create_leaf(&cluster.nodes, &alice, 40_000);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf_a], now() + 600)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .unwrap();
    let pending = coordinator.query_pending_transfers(pending_request(&bob)).unwrap();
    wallet_sim::claim_transfer(&coordinator, &bob, &pending.transfers[0])
        .await
        .unwrap();

    // One cancelled counter-swap.
    let leaf_b = wallet_sim::create_leaf(&cluster.nodes, &alice, 60_000);
    let mut swap = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf_b], now() + 600)
        .await
        .unwrap();
    swap.request.transfer_type = TransferType::CounterSwap.to_proto();
    coordinator.start_transfer(swap.request.clone()).await.unwrap();
    coordinator
        .cancel_transfer(spark::CancelTransferRequest {
            transfer_id: swap.transfer_id.clone(),
            sender_identity_pubkey: Bytes::copy_from_slice(&alice.identity()),
        })
        .await
        .unwrap();

    let query = |limit: u32, offset: u64, types: Vec<i32>| spark::QueryAllTransfersRequest {
        identity_pubkey: Bytes::copy_from_slice(&alice.identity()),
        limit,
        offset,
        types,
    };

    let page = coordinator.query_all_transfers(query(1, 0, Vec::new())).unwrap();
    assert_eq!(page.transfers.len(), 1);
    assert_eq!(page.next_offset, 1);

    let page = coordinator.query_all_transfers(query(1, page.next_offset, Vec::new())).unwrap();
    assert_eq!(page.transfers.len(), 1);
    assert_eq!(page.next_offset, 2);

    let all = coordinator.query_all_transfers(query(100, 0, Vec::new())).unwrap();
    assert_eq!(all.transfers.len(), 2);

    let swaps = coordinator
        .query_all_transfers(query(100, 0, vec![TransferType::CounterSwap.to_proto()]))
        .unwrap();
    assert_eq!(swaps.transfers.len(), 1);
    assert_eq!(swaps.transfers[0].id, swap.transfer_id);

    let both = coordinator
        .query_all_transfers(query(
            100,
            0,
            vec![
                TransferType::Transfer.to_proto(),
                TransferType::CounterSwap.to_proto(),
            ],
        ))
        .unwrap();
    assert_eq!(both.transfers.len(), 2);
}

/// A follower failing the commit round is excluded and the ceremony
/// re-picks; a follower failing the sign round forces a restart from
/// commit. Both recover without caller involvement.
#[tokio::test]
async fn signing_ceremony_survives_member_failures() {
    let cluster = LocalCluster::new(5, 3);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 100_000);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 600)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .unwrap();

    let pending = coordinator.query_pending_transfers(pending_request(&bob)).unwrap();
    let transfer = pending.transfers[0].clone();

    // The claim's sign-refunds ceremony uses fresh commitments: fault one
    // follower's commit round and another's sign round.
    cluster.client.inject_fault("1", Fault::FailNextCommit);
    cluster.client.inject_fault("2", Fault::FailNextSign);

    wallet_sim::claim_transfer(&coordinator, &bob, &transfer).await.unwrap();
    assert_eq!(owned_value(&cluster, 0, &bob), 100_000);
    let row = cluster.nodes[0].stores().transfers.get(&transfer.id).unwrap();
    assert_eq!(row.status, TransferStatus::Completed);
}

/// A second transfer generation keeps decrementing the timelock until
/// the interval floor refuses further transfers.
#[tokio::test]
async fn sequence_decrements_across_generations() {
    let cluster = LocalCluster::new(5, 3);
    let coordinator = cluster.coordinator(0);
    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);

    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 100_000);

    // Generation 1: alice -> bob.
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 600)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .unwrap();
    let pending = coordinator.query_pending_transfers(pending_request(&bob)).unwrap();
    wallet_sim::claim_transfer(&coordinator, &bob, &pending.transfers[0])
        .await
        .unwrap();

    let gen1 = cluster.nodes[0].stores().leaves.get(&leaf).unwrap();
    let timelock1 = timelock_of(sequence_of(gen1.refund_tx.as_ref().unwrap()).unwrap());
    assert_eq!(timelock1, INITIAL_TIMELOCK - TIMELOCK_INTERVAL);

    // Generation 2: bob -> alice.
    let prepared = wallet_sim::prepare_send(&coordinator, &bob, alice.identity(), &[&leaf], now() + 600)
        .await
        .unwrap();
    coordinator.start_transfer(prepared.request.clone()).await.unwrap();
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&bob, &prepared))
        .await
        .unwrap();
    let pending = coordinator.query_pending_transfers(pending_request(&alice)).unwrap();
    wallet_sim::claim_transfer(&coordinator, &alice, &pending.transfers[0])
        .await
        .unwrap();

    let gen2 = cluster.nodes[0].stores().leaves.get(&leaf).unwrap();
    let timelock2 = timelock_of(sequence_of(gen2.refund_tx.as_ref().unwrap()).unwrap());
    assert_eq!(timelock2, INITIAL_TIMELOCK - 2 * TIMELOCK_INTERVAL);
    assert!(timelock2 < timelock1);
}

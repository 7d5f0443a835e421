//! Cooperative-exit scenarios: confirmation gating, reorgs, and the
//! cancellation window.

use std::sync::Arc;

use bytes::Bytes;

use operator::chain::MockChain;
use operator::cluster::LocalCluster;
use operator::watcher::ChainWatcher;
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

struct ExitSetup {
    cluster: LocalCluster,
    chain: Arc<MockChain>,
    alice: SimWallet,
    ssp: SimWallet,
    transfer_id: String,
    exit_txid: [u8; 32],
    prepared: wallet_sim::PreparedSend,
}

/// Build a federation, a funded leaf, and an initiated (untweaked)
/// cooperative exit.
async fn setup_exit() -> ExitSetup {
    let cluster = LocalCluster::new(5, 3);
    let chain = Arc::new(MockChain::new());
    chain.mine(100);

    let alice = SimWallet::new(1);
    let ssp = SimWallet::new(3);
    let leaf = wallet_sim::create_leaf(&cluster.nodes, &alice, 100_000);

    let coordinator = cluster.coordinator(0);
    let mut prepared =
        wallet_sim::prepare_send(&coordinator, &alice, ssp.identity(), &[&leaf], now() + 3600)
            .await
            .unwrap();
    prepared.request.transfer_type = TransferType::CooperativeExit.to_proto();

    let exit_txid = [0x5E; 32];
    let response = coordinator
        .cooperative_exit(spark::CooperativeExitRequest {
            transfer: Some(prepared.request.clone()),
            exit_id: format!("exit-{}", prepared.transfer_id),
            exit_txid: Bytes::copy_from_slice(&exit_txid),
        })
        .await
        .unwrap();
    assert_eq!(
        response.transfer.as_ref().unwrap().status,
        TransferStatus::SenderKeyTweakPending.to_proto()
    );

    let transfer_id = prepared.transfer_id.clone();
    ExitSetup {
        cluster,
        chain,
        alice,
        ssp,
        transfer_id,
        exit_txid,
        prepared,
    }
}

async fn tick_all(setup: &ExitSetup) {
    for node in &setup.cluster.nodes {
        ChainWatcher::new(node.clone(), Arc::clone(&setup.chain))
            .tick()
            .await
            .unwrap();
    }
}

fn pending_for(cluster: &LocalCluster, wallet: &SimWallet) -> Vec<spark::TransferProto> {
    cluster
        .coordinator(0)
        .query_pending_transfers(spark::QueryPendingTransfersRequest {
            receiver_identity_pubkey: Bytes::copy_from_slice(&wallet.identity()),
            network: config::Network::Regtest.to_proto(),
        })
        .unwrap()
        .transfers
}

/// The tweak gate stays shut below the confirmation threshold and opens
/// at it; the claim succeeds only after.
#[tokio::test]
async fn exit_gated_on_confirmations() {
    let setup = setup_exit().await;
    let coordinator = setup.cluster.coordinator(0);

    // Sender tweaks; gate stays shut (nothing confirmed yet).
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&setup.alice, &setup.prepared))
        .await
        .unwrap();
    let row = setup.cluster.nodes[0].stores().transfers.get(&setup.transfer_id).unwrap();
    assert_eq!(row.status, TransferStatus::SenderKeyTweakPending);
    assert!(pending_for(&setup.cluster, &setup.ssp).is_empty());

    // Half the threshold: still gated.
    setup.chain.confirm_tx(setup.exit_txid);
    setup.chain.mine(2); // 3 confirmations of 6
    tick_all(&setup).await;
    let row = setup.cluster.nodes[0].stores().transfers.get(&setup.transfer_id).unwrap();
    assert_eq!(row.status, TransferStatus::SenderKeyTweakPending);
    assert!(pending_for(&setup.cluster, &setup.ssp).is_empty());

    // Reaching the threshold opens the gate on every operator.
    setup.chain.mine(3); // 6 confirmations
    tick_all(&setup).await;
    for node in &setup.cluster.nodes {
        let row = node.stores().transfers.get(&setup.transfer_id).unwrap();
        assert_eq!(row.status, TransferStatus::SenderKeyTweaked, "{}", node.id());
    }

    let pending = pending_for(&setup.cluster, &setup.ssp);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].transfer_type, TransferType::CooperativeExit.to_proto());

    wallet_sim::claim_transfer(&coordinator, &setup.ssp, &pending[0])
        .await
        .unwrap();
    let balance: u64 = setup.cluster.nodes[0]
        .stores()
        .leaves
        .query_by_owner(&setup.ssp.identity())
        .unwrap()
        .iter()
        .map(|l| l.value)
        .sum();
    assert_eq!(balance, 100_000);
}

/// A reorg that drops the exit below the threshold closes the gate
/// again; a later re-confirmation reopens it.
#[tokio::test]
async fn reorg_reverts_the_gate() {
    let setup = setup_exit().await;
    let coordinator = setup.cluster.coordinator(0);

    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&setup.alice, &setup.prepared))
        .await
        .unwrap();

    setup.chain.confirm_tx(setup.exit_txid);
    setup.chain.mine(6);
    tick_all(&setup).await;
    assert_eq!(pending_for(&setup.cluster, &setup.ssp).len(), 1);

    // The exit transaction vanishes in a reorg.
    setup.chain.reorg_out(&setup.exit_txid);
    tick_all(&setup).await;
    let row = setup.cluster.nodes[0].stores().transfers.get(&setup.transfer_id).unwrap();
    assert_eq!(row.status, TransferStatus::SenderKeyTweakPending);
    assert!(pending_for(&setup.cluster, &setup.ssp).is_empty());

    // Claim attempts are refused while the gate is shut.
    let pending_snapshot = {
        // Rebuild a transfer view for the claim attempt from history.
        coordinator
            .query_all_transfers(spark::QueryAllTransfersRequest {
                identity_pubkey: Bytes::copy_from_slice(&setup.ssp.identity()),
                limit: 10,
                offset: 0,
                types: Vec::new(),
            })
            .unwrap()
            .transfers
            .remove(0)
    };
    let err = wallet_sim::claim_transfer(&coordinator, &setup.ssp, &pending_snapshot)
        .await
        .unwrap_err();
    assert!(matches!(err, OperatorError::FailedPrecondition(_)), "{err}");

    // Re-confirmed: the claim goes through.
    setup.chain.confirm_tx(setup.exit_txid);
    setup.chain.mine(6);
    tick_all(&setup).await;
    let pending = pending_for(&setup.cluster, &setup.ssp);
    assert_eq!(pending.len(), 1);
    wallet_sim::claim_transfer(&coordinator, &setup.ssp, &pending[0])
        .await
        .unwrap();
}

/// Cancellation is allowed while the gate is shut and the sender has not
/// tweaked, and refused once the exit confirms.
#[tokio::test]
async fn exit_cancellation_window() {
    // Untweaked and unconfirmed: cancellable.
    let setup = setup_exit().await;
    let coordinator = setup.cluster.coordinator(0);
    coordinator
        .cancel_transfer(spark::CancelTransferRequest {
            transfer_id: setup.transfer_id.clone(),
            sender_identity_pubkey: Bytes::copy_from_slice(&setup.alice.identity()),
        })
        .await
        .unwrap();
    let row = setup.cluster.nodes[0].stores().transfers.get(&setup.transfer_id).unwrap();
    assert_eq!(row.status, TransferStatus::Cancelled);

    // Untweaked but confirmed: the window has closed.
    let setup = setup_exit().await;
    let coordinator = setup.cluster.coordinator(0);
    setup.chain.confirm_tx(setup.exit_txid);
    setup.chain.mine(6);
    tick_all(&setup).await;

    let err = coordinator
        .cancel_transfer(spark::CancelTransferRequest {
            transfer_id: setup.transfer_id.clone(),
            sender_identity_pubkey: Bytes::copy_from_slice(&setup.alice.identity()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OperatorError::FailedPrecondition(_)), "{err}");
}

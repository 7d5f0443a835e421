//! Five-operator Spark federation in one process.
//!
//! Boots an in-process federation, attaches chain watchers to a mock
//! chain, and runs three end-to-end scenarios while logging every state
//! transition:
//!
//! 1. A happy transfer: Alice sends a 100 000-sat leaf to Bob, Bob claims.
//! 2. A cancellation: Alice initiates, changes her mind before tweaking.
//! 3. A cooperative exit: gated on the exit transaction reaching six
//!    confirmations on the (mock) chain.
//!
//! Operator 0 keeps an LMDB transfer journal under `./data/simnet`; its
//! hash chains are verified before exit.
//!
//! ```bash
//! RUST_LOG=info cargo run --release -p simnet
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use config::FederationConfig;
use operator::chain::MockChain;
use operator::cluster::LocalFollowerClient;
use operator::watcher::ChainWatcher;
use operator::{Coordinator, OperatorNode, Stores};
use storage::journal::TransferJournal;
use transport::spark;
use wallet_sim::SimWallet;

const OPERATORS: usize = 5;
const THRESHOLD: usize = 3;
const LEAF_VALUE: u64 = 100_000;

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs()
}

fn bytes_of(bytes: &[u8]) -> bytes::Bytes {
    bytes::Bytes::copy_from_slice(bytes)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(operators = OPERATORS, threshold = THRESHOLD, "simnet starting");

    // Operator 0 journals to disk; the rest run memory-only.
    let federation = FederationConfig::local_regtest(OPERATORS, THRESHOLD);
    let journal = TransferJournal::open(&PathBuf::from("./data/simnet"))
        .expect("open transfer journal");
    let mut nodes = vec![OperatorNode::with_journal(
        federation.clone(),
        0,
        Stores::in_memory(),
        journal,
    )];
    for index in 1..OPERATORS {
        nodes.push(OperatorNode::new(
            federation.clone(),
            index as u16,
            Stores::in_memory(),
        ));
    }
    let client = Arc::new(LocalFollowerClient::new(&nodes));
    let coordinator = Coordinator::new(nodes[0].clone(), Arc::clone(&client));

    let chain = Arc::new(MockChain::new());
    chain.mine(100);
    for node in &nodes {
        let watcher = ChainWatcher::new(node.clone(), Arc::clone(&chain));
        tokio::spawn(watcher.run());
    }

    let alice = SimWallet::new(1);
    let bob = SimWallet::new(2);
    let ssp = SimWallet::new(3);

    // -----------------------------------------------------------------------
    // Scenario 1: happy transfer
    // -----------------------------------------------------------------------

    tracing::info!("scenario 1: transfer alice -> bob");
    let leaf = wallet_sim::create_leaf(&nodes, &alice, LEAF_VALUE);
    let transfer_id = run_transfer(&coordinator, &alice, &bob, &leaf).await;
    let records = nodes[0]
        .transfer_journal()
        .expect("operator 0 journals")
        .verify_chain(&transfer_id)
        .expect("journal chain intact");
    tracing::info!(%transfer_id, records, "transfer complete, journal verified");

    // -----------------------------------------------------------------------
    // Scenario 2: cancel before tweak
    // -----------------------------------------------------------------------

    tracing::info!("scenario 2: cancel before tweak");
    let leaf = wallet_sim::create_leaf(&nodes, &alice, LEAF_VALUE);
    let prepared = wallet_sim::prepare_send(&coordinator, &alice, bob.identity(), &[&leaf], now() + 600)
        .await
        .expect("prepare send");
    coordinator
        .start_transfer(prepared.request.clone())
        .await
        .expect("start transfer");
    let cancelled = coordinator
        .cancel_transfer(spark::CancelTransferRequest {
            transfer_id: prepared.transfer_id.clone(),
            sender_identity_pubkey: bytes_of(&alice.identity()),
        })
        .await
        .expect("cancel transfer");
    tracing::info!(
        transfer_id = %prepared.transfer_id,
        status = cancelled.transfer.map(|t| t.status).unwrap_or(-1),
        "transfer cancelled; leaf back with alice"
    );

    // -----------------------------------------------------------------------
    // Scenario 3: cooperative exit
    // -----------------------------------------------------------------------

    tracing::info!("scenario 3: cooperative exit gated on confirmations");
    let leaf = wallet_sim::create_leaf(&nodes, &alice, LEAF_VALUE);
    let mut prepared = wallet_sim::prepare_send(&coordinator, &alice, ssp.identity(), &[&leaf], now() + 3600)
        .await
        .expect("prepare exit");
    prepared.request.transfer_type = storage::transfer::TransferType::CooperativeExit.to_proto();

    let exit_txid = [0x5E; 32];
    coordinator
        .cooperative_exit(spark::CooperativeExitRequest {
            transfer: Some(prepared.request.clone()),
            exit_id: format!("exit-{}", prepared.transfer_id),
            exit_txid: bytes_of(&exit_txid),
        })
        .await
        .expect("cooperative exit");
    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(&alice, &prepared))
        .await
        .expect("tweak keys");

    // Gate closed: nothing is claimable yet.
    let pending = coordinator
        .query_pending_transfers(spark::QueryPendingTransfersRequest {
            receiver_identity_pubkey: bytes_of(&ssp.identity()),
            network: config::Network::Regtest.to_proto(),
        })
        .expect("query pending");
    tracing::info!(pending = pending.transfers.len(), "before confirmation");

    // Confirm the exit tx and let each watcher observe the threshold.
    chain.confirm_tx(exit_txid);
    chain.mine(6);
    for node in &nodes {
        ChainWatcher::new(node.clone(), Arc::clone(&chain))
            .tick()
            .await
            .expect("watcher tick");
    }

    let pending = coordinator
        .query_pending_transfers(spark::QueryPendingTransfersRequest {
            receiver_identity_pubkey: bytes_of(&ssp.identity()),
            network: config::Network::Regtest.to_proto(),
        })
        .expect("query pending");
    tracing::info!(pending = pending.transfers.len(), "after confirmation");
    if let Some(transfer) = pending.transfers.first() {
        wallet_sim::claim_transfer(&coordinator, &ssp, transfer)
            .await
            .expect("ssp claim");
        tracing::info!("cooperative exit claimed by ssp");
    }

    // -----------------------------------------------------------------------
    // Wrap up
    // -----------------------------------------------------------------------

    for node in &nodes {
        node.cancel_token().cancel();
    }
    tokio::task::yield_now().await;

    let balance: u64 = nodes[0]
        .stores()
        .leaves
        .query_by_owner(&bob.identity())
        .expect("query bob leaves")
        .iter()
        .map(|l| l.value)
        .sum();
    tracing::info!(bob_balance_sats = balance, "simnet finished");
}

/// One full transfer and claim; returns the transfer id.
async fn run_transfer(
    coordinator: &Coordinator<LocalFollowerClient>,
    sender: &SimWallet,
    receiver: &SimWallet,
    leaf_id: &str,
) -> String {
    let prepared =
        wallet_sim::prepare_send(coordinator, sender, receiver.identity(), &[leaf_id], now() + 600)
            .await
            .expect("prepare send");

    let response = coordinator
        .start_transfer(prepared.request.clone())
        .await
        .expect("start transfer");
    tracing::info!(
        transfer_id = %prepared.transfer_id,
        signing_results = response.signing_results.len(),
        "transfer initiated and refunds signed"
    );

    coordinator
        .send_transfer_tweak_key(wallet_sim::tweak_request(sender, &prepared))
        .await
        .expect("tweak keys");

    let pending = coordinator
        .query_pending_transfers(spark::QueryPendingTransfersRequest {
            receiver_identity_pubkey: bytes_of(&receiver.identity()),
            network: config::Network::Regtest.to_proto(),
        })
        .expect("query pending");
    let transfer = pending.transfers.first().expect("one pending transfer");

    wallet_sim::claim_transfer(coordinator, receiver, transfer)
        .await
        .expect("claim transfer");

    prepared.transfer_id
}

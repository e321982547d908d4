//! End-to-end exercise of the orchestrator's public surface: a block
//! found by Stratum, followed by its reward maturing, should persist a
//! paid block record and pay out a miner whose balance crosses the
//! pool-wide threshold.

use std::sync::Arc;
use std::time::Duration;

use kpool_node::{BlockColor, BlockInfo, MockNodeClient, MockSigner, UtxoEntry};
use kpool_pool::{Pool, PoolConfig};
use kpool_store::{Contribution, JsonStore, Store};
use kpool_stratum::PoolEvent;
use kpool_treasury::{Treasury, TreasuryConfig, TreasuryEvent};
use kpool_util::Difficulty;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn block_found_then_matured_pays_out_the_miner() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path().to_path_buf()).await.unwrap());

    let node = Arc::new(MockNodeClient::new());
    let block_hash = [5u8; 32];
    node.insert_block(
        block_hash,
        BlockInfo {
            hash: block_hash,
            daa_score: 10,
            coinbase_tx_id: None,
            coinbase_outputs: vec![],
        },
        BlockColor::Blue,
    );
    node.set_utxos(vec![UtxoEntry {
        transaction_id: [0u8; 32],
        amount: 1_000_000,
        block_daa_score: 1,
        script_public_key: vec![],
        is_coinbase: false,
    }]);

    let treasury = Treasury::new(
        node.clone(),
        Arc::new(MockSigner::new()),
        TreasuryConfig {
            funding_address: "pooladdr".into(),
            fee_bps: 0,
            coinbase_maturity_daa: 100,
            process_start_time: 0,
        },
    );

    let pool = Pool::new(
        store.clone(),
        node.clone(),
        treasury,
        PoolConfig { default_payment_threshold: 100 },
    );

    let (stratum_tx, stratum_rx) = mpsc::channel(8);
    let (treasury_tx, treasury_rx) = mpsc::channel(8);

    let run_handle = tokio::spawn(Arc::clone(&pool).run(stratum_rx, treasury_rx));

    stratum_tx
        .send(PoolEvent::BlockFound {
            hash: block_hash,
            finder: Contribution { address: "miner1".into(), difficulty: Difficulty::new(Decimal::from(100)) },
            contributions: vec![],
        })
        .await
        .unwrap();
    settle().await;

    let blocks = store.get_unpaid_blocks().await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].finder, "miner1");

    treasury_tx
        .send(TreasuryEvent::Coinbase {
            net_amount: 1000,
            gross_amount: 1000,
            reward_block_hash: Some(block_hash),
            tx_id: [9u8; 32],
            block_daa_score: 10,
        })
        .await
        .unwrap();
    settle().await;

    let miner = store.get_miner("miner1").await.unwrap();
    assert_eq!(miner.pending_balance, 0, "balance above threshold should have been paid out");

    assert!(store.get_unpaid_blocks().await.unwrap().is_empty(), "block should be marked paid");

    drop(stratum_tx);
    drop(treasury_tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;
}

#[tokio::test]
async fn block_found_then_matured_restores_balance_when_payout_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path().to_path_buf()).await.unwrap());

    let node = Arc::new(MockNodeClient::new());
    let block_hash = [6u8; 32];
    node.insert_block(
        block_hash,
        BlockInfo {
            hash: block_hash,
            daa_score: 10,
            coinbase_tx_id: None,
            coinbase_outputs: vec![],
        },
        BlockColor::Blue,
    );
    // No UTXOs registered on the node: Treasury::send will reject every
    // output with InsufficientFunds, exercising the failed-payout path.

    let treasury = Treasury::new(
        node.clone(),
        Arc::new(MockSigner::new()),
        TreasuryConfig {
            funding_address: "pooladdr".into(),
            fee_bps: 0,
            coinbase_maturity_daa: 100,
            process_start_time: 0,
        },
    );

    let pool = Pool::new(
        store.clone(),
        node.clone(),
        treasury,
        PoolConfig { default_payment_threshold: 100 },
    );

    let (stratum_tx, stratum_rx) = mpsc::channel(8);
    let (treasury_tx, treasury_rx) = mpsc::channel(8);

    let run_handle = tokio::spawn(Arc::clone(&pool).run(stratum_rx, treasury_rx));

    stratum_tx
        .send(PoolEvent::BlockFound {
            hash: block_hash,
            finder: Contribution { address: "miner2".into(), difficulty: Difficulty::new(Decimal::from(100)) },
            contributions: vec![],
        })
        .await
        .unwrap();
    settle().await;

    treasury_tx
        .send(TreasuryEvent::Coinbase {
            net_amount: 1000,
            gross_amount: 1000,
            reward_block_hash: Some(block_hash),
            tx_id: [9u8; 32],
            block_daa_score: 10,
        })
        .await
        .unwrap();
    settle().await;

    let miner = store.get_miner("miner2").await.unwrap();
    assert_eq!(
        miner.pending_balance, 1000,
        "a failed send must restore the miner's share, not just leave it zeroed"
    );

    // The block is still folded into the paid set: crediting the share is
    // durable independent of whether the subsequent send succeeds.
    assert!(store.get_unpaid_blocks().await.unwrap().is_empty());

    drop(stratum_tx);
    drop(treasury_tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;
}

#[tokio::test]
async fn force_payout_returns_nothing_to_pay_for_empty_balance() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path().to_path_buf()).await.unwrap());
    let node = Arc::new(MockNodeClient::new());
    let treasury = Treasury::new(
        node.clone(),
        Arc::new(MockSigner::new()),
        TreasuryConfig {
            funding_address: "pooladdr".into(),
            fee_bps: 0,
            coinbase_maturity_daa: 100,
            process_start_time: 0,
        },
    );
    let pool = Pool::new(store, node, treasury, PoolConfig { default_payment_threshold: 100 });

    let result = pool.force_payout("nobody").await;
    assert!(result.is_err());
}

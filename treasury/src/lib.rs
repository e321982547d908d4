//! Coinbase-maturity watcher and on-chain payment sender (spec §4.D
//! "Treasury"). Watches the funding address's UTXO stream, splits each
//! matured coinbase into pool fee and net miner reward, maintains a
//! best-effort reverse index from coinbase transaction id to the block hash
//! that produced it, and sends payouts one transaction per recipient.
//!
//! The maturity DAA parameter and the funding address are carried as fields
//! of [`TreasuryConfig`] rather than a process-wide singleton (spec §9
//! "Global-state escapes").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kpool_node::{BlockInfo, Hash, MaturityEvent, NodeClient, NodeError, PaymentOutput, Signer};
use log::{debug, error, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;

/// Coinbases whose block is older than this, relative to process start, are
/// treated as noise from a fresh install rather than state to recover on
/// restart (spec §4.D).
const STALE_COINBASE_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Reconnect the block-added stream if nothing arrives for this long
/// (spec §5 "Block-stream watchdog").
const BLOCK_STREAM_WATCHDOG_SECS: u64 = 120;

#[derive(Debug, Clone, Deserialize)]
pub struct TreasuryConfig {
    pub funding_address: String,
    /// Pool fee in basis points (`feePercent * 100`, spec §4.D).
    pub fee_bps: u32,
    /// Coinbase maturity, in DAA steps (e.g. 100 on mainnet). Surfaced here
    /// only for callers that need it alongside the rest of the Treasury's
    /// configuration; the watcher itself relies on the node's own maturity
    /// event, it does not recompute maturity from DAA scores.
    pub coinbase_maturity_daa: u64,
    /// Unix timestamp this process started at, used to filter stale
    /// bootstrap coinbases (spec §4.D).
    pub process_start_time: u64,
}

impl TreasuryConfig {
    /// `fee = floor(gross * feeBps / 10_000)`.
    pub fn fee_of(&self, gross_amount: u64) -> u64 {
        ((gross_amount as u128 * self.fee_bps as u128) / 10_000) as u64
    }
}

/// Emitted when a coinbase matures (`Coinbase`) and, alongside it, the
/// pool's own fee revenue for that coinbase (`Revenue`) — spec §4.D.
#[derive(Debug, Clone)]
pub enum TreasuryEvent {
    Coinbase {
        net_amount: u64,
        gross_amount: u64,
        reward_block_hash: Option<Hash>,
        tx_id: Hash,
        block_daa_score: u64,
    },
    Revenue {
        pool_fee: u64,
    },
}

#[derive(Debug, Error)]
pub enum TreasuryError {
    #[error("node error: {0}")]
    Node(#[from] NodeError),
    #[error("insufficient treasury funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },
}

/// Watches coinbase maturity for the pool's funding address and exposes an
/// on-demand payment sender. Holds the funding key's [`Signer`]; no other
/// crate in this workspace is handed that handle (spec §5 "the funding key
/// is never shared with any session task").
pub struct Treasury {
    node: Arc<dyn NodeClient>,
    signer: Arc<dyn Signer>,
    config: TreasuryConfig,
    /// Best-effort coinbase tx id -> block hash index (spec §4.D).
    coinbase_index: RwLock<HashMap<Hash, Hash>>,
}

impl Treasury {
    pub fn new(node: Arc<dyn NodeClient>, signer: Arc<dyn Signer>, config: TreasuryConfig) -> Arc<Self> {
        Arc::new(Treasury {
            node,
            signer,
            config,
            coinbase_index: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribes to the node's UTXO-processor maturity stream and starts
    /// the block-added watcher that feeds the reverse index. Returns a
    /// channel the orchestrator drains for [`TreasuryEvent`]s.
    pub async fn watch(self: &Arc<Self>) -> Result<mpsc::Receiver<TreasuryEvent>, TreasuryError> {
        let (events_tx, events_rx) = mpsc::channel(256);

        let block_watcher = Arc::clone(self);
        tokio::spawn(async move {
            block_watcher.watch_blocks().await;
        });

        let mut maturity_stream = self
            .node
            .subscribe_utxo_maturity(&self.config.funding_address)
            .await?;
        let maturity_watcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = maturity_stream.recv().await {
                maturity_watcher.handle_maturity(event, &events_tx).await;
            }
            warn!("utxo maturity stream ended");
        });

        Ok(events_rx)
    }

    /// Consumes `block-added` events to build the coinbase reverse index,
    /// reconnecting whenever [`BLOCK_STREAM_WATCHDOG_SECS`] pass without a
    /// block (spec §5 "Block-stream watchdog").
    async fn watch_blocks(self: Arc<Self>) {
        loop {
            let mut stream = match self.node.subscribe_block_added().await {
                Ok(stream) => stream,
                Err(err) => {
                    error!("failed to subscribe to block-added stream: {err}");
                    sleep(Duration::from_secs(BLOCK_STREAM_WATCHDOG_SECS)).await;
                    continue;
                }
            };

            loop {
                match tokio::time::timeout(Duration::from_secs(BLOCK_STREAM_WATCHDOG_SECS), stream.recv()).await {
                    Ok(Some(info)) => self.index_block(info).await,
                    Ok(None) => {
                        warn!("block-added stream closed, reconnecting");
                        break;
                    }
                    Err(_) => {
                        warn!("no blocks in {BLOCK_STREAM_WATCHDOG_SECS}s, reconnecting block-added stream");
                        break;
                    }
                }
            }
        }
    }

    async fn index_block(&self, info: BlockInfo) {
        let Some(tx_id) = info.coinbase_tx_id else {
            return;
        };
        let pays_funding_address = info
            .coinbase_outputs
            .iter()
            .any(|output| output.address == self.config.funding_address);
        if pays_funding_address {
            debug!("indexed coinbase {} -> block {}", hex::encode(tx_id), hex::encode(info.hash));
            self.coinbase_index.write().await.insert(tx_id, info.hash);
        }
    }

    async fn handle_maturity(&self, event: MaturityEvent, events: &mpsc::Sender<TreasuryEvent>) {
        let cutoff = self.config.process_start_time.saturating_sub(STALE_COINBASE_WINDOW_SECS);
        if event.block_timestamp < cutoff {
            debug!(
                "ignoring stale coinbase {} from before the bootstrap window",
                hex::encode(event.transaction_id)
            );
            return;
        }

        let fee = self.config.fee_of(event.gross_amount);
        let net = event.gross_amount.saturating_sub(fee);
        let reward_block_hash = self.coinbase_index.read().await.get(&event.transaction_id).copied();

        info!(
            "coinbase matured: gross={} fee={} net={} tx={}",
            event.gross_amount,
            fee,
            net,
            hex::encode(event.transaction_id)
        );

        if events
            .send(TreasuryEvent::Coinbase {
                net_amount: net,
                gross_amount: event.gross_amount,
                reward_block_hash,
                tx_id: event.transaction_id,
                block_daa_score: event.block_daa_score,
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = events.send(TreasuryEvent::Revenue { pool_fee: fee }).await;
    }

    /// Sends one on-chain transaction per output (spec §4.D "no batching").
    /// Re-fetches the UTXO set before each output so concurrent iterations
    /// never double-spend the same inputs.
    pub async fn send(&self, outputs: &[PaymentOutput]) -> Result<Vec<Hash>, TreasuryError> {
        let mut tx_ids = Vec::with_capacity(outputs.len());
        for output in outputs {
            let utxos = self
                .node
                .get_utxos_by_addresses(std::slice::from_ref(&self.config.funding_address))
                .await?;
            let available: u64 = utxos.iter().map(|u| u.amount).sum();
            if available < output.amount {
                return Err(TreasuryError::InsufficientFunds {
                    requested: output.amount,
                    available,
                });
            }

            let fee_estimate = self.node.get_fee_estimate().await?;
            let signed = self
                .signer
                .sign(std::slice::from_ref(output), &utxos, fee_estimate)
                .await?;
            self.node.submit_transaction(&signed).await?;
            info!("sent {} sompi to {}", output.amount, output.address);
            tx_ids.push(signed.id);
        }
        Ok(tx_ids)
    }

    /// Current on-chain balance of the funding address, used by the force-
    /// all payout path to check treasury solvency before submitting a
    /// partial set (spec §4.E.5).
    pub async fn balance(&self) -> Result<u64, TreasuryError> {
        let utxos = self
            .node
            .get_utxos_by_addresses(std::slice::from_ref(&self.config.funding_address))
            .await?;
        Ok(utxos.iter().map(|u| u.amount).sum())
    }

    pub fn funding_address(&self) -> &str {
        &self.config.funding_address
    }

    /// Exposed so the Pool orchestrator can compute the fee on a
    /// coinbase it reconstructed itself during restart recovery, without
    /// waiting for the ordinary maturity stream (spec §4.E.2).
    pub fn fee_of(&self, gross_amount: u64) -> u64 {
        self.config.fee_of(gross_amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpool_node::{MockNodeClient, MockSigner, UtxoEntry};

    fn config() -> TreasuryConfig {
        TreasuryConfig {
            funding_address: "pooladdr".into(),
            fee_bps: 100, // 1%
            coinbase_maturity_daa: 100,
            process_start_time: 10_000,
        }
    }

    #[test]
    fn fee_of_rounds_down() {
        let cfg = config();
        assert_eq!(cfg.fee_of(99), 0);
        assert_eq!(cfg.fee_of(1_000_000), 10_000);
    }

    #[tokio::test]
    async fn stale_coinbase_is_filtered_but_recent_restart_coinbase_is_not() {
        let node = Arc::new(MockNodeClient::new());
        let signer = Arc::new(MockSigner::new());
        let treasury = Treasury::new(node.clone(), signer, config());

        let mut events = treasury.watch().await.unwrap();

        node.push_maturity(MaturityEvent {
            transaction_id: [1u8; 32],
            gross_amount: 1000,
            block_daa_score: 1,
            block_timestamp: 0, // far older than the 24h window before start
        })
        .await;
        node.push_maturity(MaturityEvent {
            transaction_id: [2u8; 32],
            gross_amount: 2000,
            block_daa_score: 2,
            block_timestamp: 9_999, // just before start, within the 24h grace window
        })
        .await;

        let first = events.recv().await.unwrap();
        match first {
            TreasuryEvent::Coinbase { tx_id, gross_amount, .. } => {
                assert_eq!(tx_id, [2u8; 32]);
                assert_eq!(gross_amount, 2000);
            }
            _ => panic!("expected a coinbase event"),
        }
    }

    #[tokio::test]
    async fn coinbase_event_splits_fee_and_net() {
        let node = Arc::new(MockNodeClient::new());
        let signer = Arc::new(MockSigner::new());
        let treasury = Treasury::new(node.clone(), signer, config());

        let mut events = treasury.watch().await.unwrap();
        node.push_maturity(MaturityEvent {
            transaction_id: [9u8; 32],
            gross_amount: 1_000_000,
            block_daa_score: 5,
            block_timestamp: 10_000,
        })
        .await;

        let coinbase = events.recv().await.unwrap();
        let revenue = events.recv().await.unwrap();
        match (coinbase, revenue) {
            (
                TreasuryEvent::Coinbase { net_amount, gross_amount, .. },
                TreasuryEvent::Revenue { pool_fee },
            ) => {
                assert_eq!(gross_amount, 1_000_000);
                assert_eq!(pool_fee, 10_000);
                assert_eq!(net_amount, 990_000);
            }
            _ => panic!("expected coinbase then revenue"),
        }
    }

    #[tokio::test]
    async fn block_added_stream_builds_reverse_index() {
        let node = Arc::new(MockNodeClient::new());
        let signer = Arc::new(MockSigner::new());
        let treasury = Treasury::new(node.clone(), signer, config());

        let mut events = treasury.watch().await.unwrap();
        // give the spawned block-added watcher a chance to subscribe
        tokio::task::yield_now().await;

        node.push_block_added(BlockInfo {
            hash: [7u8; 32],
            daa_score: 5,
            coinbase_tx_id: Some([9u8; 32]),
            coinbase_outputs: vec![PaymentOutput {
                address: "pooladdr".into(),
                amount: 1_000_000,
            }],
        })
        .await;
        // allow the watcher task to process the event before the maturity fires
        tokio::time::sleep(Duration::from_millis(20)).await;

        node.push_maturity(MaturityEvent {
            transaction_id: [9u8; 32],
            gross_amount: 1_000_000,
            block_daa_score: 5,
            block_timestamp: 10_000,
        })
        .await;

        match events.recv().await.unwrap() {
            TreasuryEvent::Coinbase { reward_block_hash, .. } => {
                assert_eq!(reward_block_hash, Some([7u8; 32]));
            }
            _ => panic!("expected a coinbase event"),
        }
    }

    #[tokio::test]
    async fn send_fails_on_insufficient_funds() {
        let node = Arc::new(MockNodeClient::new());
        node.set_utxos(vec![UtxoEntry {
            transaction_id: [0u8; 32],
            amount: 100,
            block_daa_score: 1,
            script_public_key: vec![],
            is_coinbase: false,
        }]);
        let signer = Arc::new(MockSigner::new());
        let treasury = Treasury::new(node, signer, config());

        let result = treasury
            .send(&[PaymentOutput { address: "miner1".into(), amount: 1000 }])
            .await;
        assert!(matches!(result, Err(TreasuryError::InsufficientFunds { .. })));
    }

    #[tokio::test]
    async fn send_succeeds_and_returns_tx_ids() {
        let node = Arc::new(MockNodeClient::new());
        node.set_utxos(vec![UtxoEntry {
            transaction_id: [0u8; 32],
            amount: 10_000,
            block_daa_score: 1,
            script_public_key: vec![],
            is_coinbase: false,
        }]);
        let signer = Arc::new(MockSigner::new());
        let treasury = Treasury::new(node, signer, config());

        let result = treasury
            .send(&[PaymentOutput { address: "miner1".into(), amount: 1000 }])
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }
}

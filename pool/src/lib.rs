//! Wires the Store, Stratum and Treasury crates into the mining pool
//! orchestrator described in spec §4.E: records blocks Stratum reports,
//! restores unpaid-block state across restarts, runs the PPLNS reward
//! fold, and executes payouts (normal, threshold/interval-triggered, or
//! forced).

mod orchestrator;
mod recovery;
mod reward;

pub use reward::{decode_hash, BlockWork, RewardState};

use std::sync::Arc;

use kpool_node::{Hash, NodeClient};
use kpool_store::{Store, StoreError};
use kpool_treasury::{Treasury, TreasuryError};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

/// How old an unpaid, persisted block must be at startup before it is
/// swept for a possibly-missed maturity event (spec §4.E.2).
pub const MATURE_SWEEP_AGE_SECS: u64 = 120;
/// Delay before the startup mature-block sweep runs, giving the node
/// client and Treasury time to finish connecting (spec §4.E.2).
pub const MATURE_SWEEP_STARTUP_DELAY_SECS: u64 = 5;
/// A coinbase UTXO is considered a forwarding match if its DAA score is
/// within this many steps of the block's own DAA score (spec §4.E.3 stage
/// 4).
pub const FORWARDED_UTXO_DAA_WINDOW: u64 = 100;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("treasury error: {0}")]
    Treasury(#[from] TreasuryError),
    #[error("nothing to pay for this address")]
    NothingToPay,
    #[error("treasury short: required {required}, available {available}")]
    TreasuryShortfall { required: u64, available: u64 },
}

/// Pool-wide defaults; per-miner overrides live in the Store
/// (spec §6 config table "treasury.rewarding.paymentThreshold").
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub default_payment_threshold: u64,
}

/// The orchestrator (spec §4.E). Holds no socket or HTTP state of its own
/// — those live in [`kpool_stratum::StratumServer`] and `kpool-api`; this
/// type is the reward/payout brain the rest of the workspace drives
/// through [`kpool_stratum::PoolEvent`] and [`kpool_treasury::TreasuryEvent`].
pub struct Pool {
    store: Arc<dyn Store>,
    node: Arc<dyn NodeClient>,
    treasury: Arc<Treasury>,
    config: PoolConfig,
    reward_state: RwLock<RewardState>,
    /// Serializes reward distribution: at most one computation runs at a
    /// time (spec §5 "a simple processing latch").
    distribution_lock: Mutex<()>,
}

impl Pool {
    pub fn new(store: Arc<dyn Store>, node: Arc<dyn NodeClient>, treasury: Arc<Treasury>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Pool {
            store,
            node,
            treasury,
            config,
            reward_state: RwLock::new(RewardState::default()),
            distribution_lock: Mutex::new(()),
        })
    }

    /// Runs restart recovery, then starts the Stratum/Treasury event loop
    /// and the one-shot mature-block sweep. Returns once the event loop
    /// exits (both channels closed).
    pub async fn run(
        self: Arc<Self>,
        stratum_events: mpsc::Receiver<kpool_stratum::PoolEvent>,
        treasury_events: mpsc::Receiver<kpool_treasury::TreasuryEvent>,
    ) {
        if let Err(err) = self.restore_if_empty().await {
            log::error!("restart recovery failed: {err}");
        }
        Arc::clone(&self).spawn_mature_block_sweep();
        self.run_event_loop(stratum_events, treasury_events).await;
    }

    pub async fn force_payout(&self, address: &str) -> Result<Hash, PoolError> {
        self.force_payout_single(address).await
    }

    pub async fn force_payout_all(&self) -> Result<Vec<Hash>, PoolError> {
        self.force_payout_everyone().await
    }
}

//! The pool's durable map of miner balances, found blocks and payment
//! history (spec §4.A "Store"). The only implementation shipped here is a
//! JSON-file, copy-on-write backend, grounded on the same per-sub-domain
//! cache-plus-flush pattern as other JSON-backed stores in this codebase's
//! lineage, but the [`Store`] trait is the seam everything else in the
//! workspace depends on.

use async_trait::async_trait;
use kpool_util::Difficulty;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod json_store;

pub use json_store::JsonStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("balance of {current} cannot absorb a delta of {delta}")]
    NegativeBalance { current: u64, delta: i64 },

    #[error("not found: {0}")]
    NotFound(String),
}

/// Per-miner accounting record. Keyed by canonical address (spec §9
/// "Address/prefix policy" — never the external `kaspa:`-prefixed form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerRecord {
    /// Sompi can exceed 2^53; serialized as a JSON string (spec §6
    /// "Persistence layout").
    #[serde(with = "kpool_util::serde_amount")]
    pub pending_balance: u64,
    #[serde(with = "kpool_util::serde_amount::option")]
    pub payment_threshold: Option<u64>,
    pub payment_interval_hours: Option<u64>,
    pub last_payout_time: u64,
    pub blocks_found: u64,
}

impl Default for MinerRecord {
    fn default() -> Self {
        MinerRecord {
            pending_balance: 0,
            payment_threshold: None,
            payment_interval_hours: None,
            last_payout_time: 0,
            blocks_found: 0,
        }
    }
}

/// One miner's share of a found block's reward, recorded at distribution
/// time so the block's history is self-contained and auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub address: String,
    pub difficulty: Difficulty,
}

/// A block found by the pool, plus the PPLNS distribution it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: String,
    pub finder: String,
    pub timestamp: u64,
    pub finder_difficulty: Difficulty,
    pub daa_score: u64,
    pub paid: bool,
    pub contributions: Vec<Contribution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Sent,
    Failed,
    Restored,
}

/// A record of one attempted payout, whether it succeeded, failed, or was
/// restored to miner balances after a failed send (spec §4.D.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub tx_id: String,
    pub address: String,
    /// Sompi can exceed 2^53; serialized as a JSON string (spec §6
    /// "Persistence layout").
    #[serde(with = "kpool_util::serde_amount")]
    pub amount: u64,
    pub status: PaymentStatus,
    pub block_hashes: Vec<String>,
    #[serde(with = "kpool_util::serde_amount")]
    pub balance_before: u64,
    pub timestamp: u64,
}

/// A patch applied to an existing [`PaymentRecord`] by tx id, used once a
/// pending send resolves (spec §4.D.3 "Send").
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub tx_id: Option<String>,
}

/// The durable map of miner balances, found blocks and payment history
/// (spec §4.A). Every method is keyed on the canonical address form; callers
/// are responsible for canonicalizing at the boundary.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_miner(&self, address: &str) -> Result<MinerRecord, StoreError>;

    /// Applies `delta` to `address`'s pending balance. `delta` may be
    /// negative (a payout); the call fails rather than let a balance go
    /// negative.
    async fn add_balance(&self, address: &str, delta: i64) -> Result<u64, StoreError>;

    async fn set_payment_interval(&self, address: &str, hours: Option<u64>) -> Result<(), StoreError>;

    async fn set_payment_threshold(&self, address: &str, threshold: Option<u64>) -> Result<(), StoreError>;

    async fn set_last_payout_time(&self, address: &str, timestamp: u64) -> Result<(), StoreError>;

    async fn increment_block_count(&self, address: &str) -> Result<(), StoreError>;

    /// Idempotent on `hash`: a second call with the same hash updates `paid`
    /// and `contributions` in place instead of duplicating the record.
    async fn add_block(&self, record: BlockRecord) -> Result<(), StoreError>;

    async fn mark_block_paid(&self, hash: &str) -> Result<(), StoreError>;

    /// Most recent blocks first, bounded to `limit`.
    async fn get_blocks(&self, limit: usize) -> Result<Vec<BlockRecord>, StoreError>;

    /// Blocks found by `address`, most recent first, bounded to `limit`.
    async fn get_blocks_by_address(&self, address: &str, limit: usize) -> Result<Vec<BlockRecord>, StoreError>;

    /// Blocks not yet marked paid, oldest first — used for restart recovery
    /// (spec §4.E.2).
    async fn get_unpaid_blocks(&self) -> Result<Vec<BlockRecord>, StoreError>;

    async fn add_payment(&self, record: PaymentRecord) -> Result<(), StoreError>;

    async fn update_payment(&self, tx_id: &str, update: PaymentUpdate) -> Result<(), StoreError>;

    /// All miner records except the reserved pool-revenue key.
    async fn get_all_miners(&self) -> Result<Vec<(String, MinerRecord)>, StoreError>;
}

//! The upstream collaborators this pool consumes but does not design:
//! the full-node RPC peer (§6) and the wallet signer/sender. Both are
//! modeled as traits plus a deterministic in-memory mock so the rest of
//! the workspace can be exercised without a real Kaspa-style node.
//!
//! Per spec §1, neither the wire protocol to the node nor wallet key
//! material/transaction signing is designed here — only the shape of the
//! operations the pool needs to call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;

pub use mock::{MockNodeClient, MockPow, MockSigner};

/// A 32-byte hash: a pre-PoW hash, a block hash, or a transaction id,
/// depending on context.
pub type Hash = [u8; 32];

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("node reports initial block download in progress")]
    InitialBlockDownload,
    #[error("node reports no route to peers")]
    NoRoute,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },
    #[error("signing error: {0}")]
    Signing(String),
}

/// Whether a block is judged to be on the canonical DAG front ("blue") by
/// consensus, or is still pending/unknown (spec Glossary "Blue block").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockColor {
    Blue,
    Red,
    Unknown,
}

/// An opaque block template: header bytes plus a coinbase transaction
/// already paying the pool's funding address. The pool never parses this
/// payload; it only stamps a nonce into it via [`PowVerifier`].
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub pre_pow_hash: Hash,
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

/// What the node told us about a block hash we previously submitted, or
/// about a block it just added to the DAG (spec §4.D "best-effort reverse
/// index from coinbase transaction ID to block hash").
#[derive(Debug, Clone)]
pub struct BlockInfo {
    /// The canonical hash the node recorded for this block (the node may
    /// have normalized or otherwise mutated header bytes on acceptance).
    pub hash: Hash,
    pub daa_score: u64,
    /// The coinbase transaction id, present when this `BlockInfo` came from
    /// the `block-added` stream rather than a post-submission lookup.
    pub coinbase_tx_id: Option<Hash>,
    /// Coinbase outputs, used to spot the ones paying the pool's funding
    /// address when building the tx-id -> block-hash reverse index.
    pub coinbase_outputs: Vec<PaymentOutput>,
}

#[derive(Debug, Clone, Copy)]
pub struct FeeEstimate {
    pub fee_per_byte: u64,
}

/// A single unspent output as reported by the node, enough to drive the
/// Treasury's coinbase-maturity and value-reconstruction logic.
#[derive(Debug, Clone)]
pub struct UtxoEntry {
    pub transaction_id: Hash,
    pub amount: u64,
    pub block_daa_score: u64,
    pub script_public_key: Vec<u8>,
    pub is_coinbase: bool,
}

/// Emitted by the node's UTXO-processor abstraction when a coinbase UTXO
/// paying the funding address reaches maturity.
#[derive(Debug, Clone)]
pub struct MaturityEvent {
    pub transaction_id: Hash,
    pub gross_amount: u64,
    pub block_daa_score: u64,
    pub block_timestamp: u64,
}

/// One on-chain payment output.
#[derive(Debug, Clone)]
pub struct PaymentOutput {
    pub address: String,
    pub amount: u64,
}

/// A transaction ready to submit, produced by [`Signer::sign`].
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub id: Hash,
    pub raw: Vec<u8>,
}

/// The PoW verifier associated with a single template, produced by the
/// node/consensus layer when the template is admitted. The pool never
/// implements or audits the PoW algorithm itself (spec §1 non-goals) — it
/// only asks this primitive whether a nonce is a block and what target it
/// hit.
pub trait PowVerifier: Send + Sync {
    /// Returns `(is_block, target_hit)`. `target_hit` is compared against
    /// the implied target of the submitting session's difficulty.
    fn check_work(&self, nonce: u64) -> (bool, kpool_util::Target);

    /// Stamp the winning nonce into the template payload and return the
    /// finalized block bytes ready for `submit_block`.
    fn finalize(&self, nonce: u64) -> Vec<u8>;
}

pub type TemplateReceiver = mpsc::Receiver<BlockTemplate>;
pub type BlockAddedReceiver = mpsc::Receiver<BlockInfo>;
pub type MaturityReceiver = mpsc::Receiver<MaturityEvent>;

/// The fixed set of remote operations this pool consumes from the
/// upstream full node (spec §6 "Node RPC (consumed, not designed)").
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_block_template(&self, extra_data: &str) -> Result<BlockTemplate, NodeError>;

    /// Construct the [`PowVerifier`] for a freshly announced template.
    fn make_verifier(&self, template: &BlockTemplate) -> Box<dyn PowVerifier>;

    async fn submit_block(&self, payload: Vec<u8>) -> Result<(), NodeError>;

    /// `Ok(None)` means the node does not know this hash (orphan/rejected).
    async fn get_block(&self, hash: &Hash) -> Result<Option<BlockInfo>, NodeError>;

    async fn get_current_block_color(&self, hash: &Hash) -> Result<BlockColor, NodeError>;

    async fn get_daa_score_timestamp_estimate(&self, daa_score: u64) -> Result<u64, NodeError>;

    async fn get_fee_estimate(&self) -> Result<FeeEstimate, NodeError>;

    async fn get_utxos_by_addresses(&self, addresses: &[String]) -> Result<Vec<UtxoEntry>, NodeError>;

    /// Broadcasts an already-signed transaction. The Treasury is the only
    /// caller; Stratum and the Pool orchestrator never touch this path.
    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<(), NodeError>;

    async fn subscribe_new_block_template(&self) -> Result<TemplateReceiver, NodeError>;

    async fn subscribe_block_added(&self) -> Result<BlockAddedReceiver, NodeError>;

    async fn subscribe_utxo_maturity(&self, funding_address: &str) -> Result<MaturityReceiver, NodeError>;
}

/// The wallet black box (spec §1: "treated as a black-box signer/sender").
#[async_trait]
pub trait Signer: Send + Sync {
    /// Build, sign and return a transaction paying `outputs` out of
    /// `utxos`, at the given fee rate. Never broadcasts.
    async fn sign(
        &self,
        outputs: &[PaymentOutput],
        utxos: &[UtxoEntry],
        fee_estimate: FeeEstimate,
    ) -> Result<SignedTransaction, NodeError>;
}

//! Deterministic test doubles for [`NodeClient`], [`PowVerifier`] and
//! [`Signer`], used throughout the workspace's test suites so that
//! Stratum/Pool/Treasury logic can be exercised without a real node.

use crate::{
    BlockInfo, BlockTemplate, FeeEstimate, Hash, MaturityReceiver, NodeClient, NodeError,
    PaymentOutput, PowVerifier, SignedTransaction, Signer, TemplateReceiver, UtxoEntry,
};
use async_trait::async_trait;
use kpool_util::Target;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A PoW verifier whose answers are pre-programmed by the test: a map of
/// nonce to `(is_block, target_hit)`, with a default "share but not block,
/// at a generous target" answer for anything not explicitly listed.
pub struct MockPow {
    payload: Vec<u8>,
    answers: HashMap<u64, (bool, Target)>,
    default_target: Target,
}

impl MockPow {
    pub fn new(payload: Vec<u8>) -> Self {
        MockPow {
            payload,
            answers: HashMap::new(),
            default_target: Target::from_bytes_be([0u8; 32]),
        }
    }

    /// Program a specific nonce's answer.
    pub fn with_answer(mut self, nonce: u64, is_block: bool, target: Target) -> Self {
        self.answers.insert(nonce, (is_block, target));
        self
    }
}

impl PowVerifier for MockPow {
    fn check_work(&self, nonce: u64) -> (bool, Target) {
        self.answers
            .get(&nonce)
            .cloned()
            .unwrap_or_else(|| (false, self.default_target.clone()))
    }

    fn finalize(&self, nonce: u64) -> Vec<u8> {
        let mut out = self.payload.clone();
        out.extend_from_slice(&nonce.to_le_bytes());
        out
    }
}

struct MockState {
    blocks: HashMap<Hash, BlockInfo>,
    block_colors: HashMap<Hash, crate::BlockColor>,
    submitted: Vec<Vec<u8>>,
    submitted_txs: Vec<SignedTransaction>,
    utxos: Vec<UtxoEntry>,
    fee_estimate: FeeEstimate,
    fail_submit: bool,
    fail_submit_transaction: bool,
    block_added_tx: Option<mpsc::Sender<BlockInfo>>,
    maturity_tx: Option<mpsc::Sender<crate::MaturityEvent>>,
}

/// An in-memory [`NodeClient`] driven entirely by test setup calls; no
/// network I/O, no subscriptions fire unless a test explicitly sends on
/// the channel it gets back (or via [`MockNodeClient::push_block_added`] /
/// [`MockNodeClient::push_maturity`] after subscribing).
pub struct MockNodeClient {
    state: Mutex<MockState>,
}

impl Default for MockNodeClient {
    fn default() -> Self {
        MockNodeClient {
            state: Mutex::new(MockState {
                blocks: HashMap::new(),
                block_colors: HashMap::new(),
                submitted: Vec::new(),
                submitted_txs: Vec::new(),
                utxos: Vec::new(),
                fee_estimate: FeeEstimate { fee_per_byte: 1 },
                fail_submit: false,
                fail_submit_transaction: false,
                block_added_tx: None,
                maturity_tx: None,
            }),
        }
    }
}

impl MockNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_block(&self, hash: Hash, info: BlockInfo, color: crate::BlockColor) {
        let mut state = self.state.lock().unwrap();
        state.blocks.insert(hash, info);
        state.block_colors.insert(hash, color);
    }

    pub fn set_utxos(&self, utxos: Vec<UtxoEntry>) {
        self.state.lock().unwrap().utxos = utxos;
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.state.lock().unwrap().fail_submit = fail;
    }

    pub fn submitted_count(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }

    pub fn set_fail_submit_transaction(&self, fail: bool) {
        self.state.lock().unwrap().fail_submit_transaction = fail;
    }

    pub fn submitted_transactions(&self) -> Vec<SignedTransaction> {
        self.state.lock().unwrap().submitted_txs.clone()
    }

    /// Pushes a `block-added` event to whichever task is currently holding
    /// the receiver from [`NodeClient::subscribe_block_added`]. No-op if
    /// nobody has subscribed yet.
    pub async fn push_block_added(&self, info: BlockInfo) {
        let sender = self.state.lock().unwrap().block_added_tx.clone();
        if let Some(sender) = sender {
            let _ = sender.send(info).await;
        }
    }

    /// Pushes a coinbase-maturity event to the current
    /// [`NodeClient::subscribe_utxo_maturity`] subscriber, if any.
    pub async fn push_maturity(&self, event: crate::MaturityEvent) {
        let sender = self.state.lock().unwrap().maturity_tx.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn get_block_template(&self, _extra_data: &str) -> Result<BlockTemplate, NodeError> {
        Ok(BlockTemplate {
            pre_pow_hash: [0u8; 32],
            payload: vec![0u8; 32],
            timestamp: kpool_util::now_secs(),
        })
    }

    fn make_verifier(&self, template: &BlockTemplate) -> Box<dyn PowVerifier> {
        Box::new(MockPow::new(template.payload.clone()))
    }

    async fn submit_block(&self, payload: Vec<u8>) -> Result<(), NodeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_submit {
            return Err(NodeError::Transport("mock submit failure".into()));
        }
        state.submitted.push(payload);
        Ok(())
    }

    async fn get_block(&self, hash: &Hash) -> Result<Option<BlockInfo>, NodeError> {
        Ok(self.state.lock().unwrap().blocks.get(hash).cloned())
    }

    async fn get_current_block_color(&self, hash: &Hash) -> Result<crate::BlockColor, NodeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .block_colors
            .get(hash)
            .copied()
            .unwrap_or(crate::BlockColor::Unknown))
    }

    async fn get_daa_score_timestamp_estimate(&self, daa_score: u64) -> Result<u64, NodeError> {
        Ok(daa_score)
    }

    async fn get_fee_estimate(&self) -> Result<FeeEstimate, NodeError> {
        Ok(self.state.lock().unwrap().fee_estimate)
    }

    async fn get_utxos_by_addresses(&self, _addresses: &[String]) -> Result<Vec<UtxoEntry>, NodeError> {
        Ok(self.state.lock().unwrap().utxos.clone())
    }

    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<(), NodeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_submit_transaction {
            return Err(NodeError::Transport("mock transaction submit failure".into()));
        }
        state.submitted_txs.push(tx.clone());
        Ok(())
    }

    async fn subscribe_new_block_template(&self) -> Result<TemplateReceiver, NodeError> {
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        Ok(rx)
    }

    async fn subscribe_block_added(&self) -> Result<crate::BlockAddedReceiver, NodeError> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        self.state.lock().unwrap().block_added_tx = Some(tx);
        Ok(rx)
    }

    async fn subscribe_utxo_maturity(&self, _funding_address: &str) -> Result<MaturityReceiver, NodeError> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        self.state.lock().unwrap().maturity_tx = Some(tx);
        Ok(rx)
    }
}

/// A signer that always succeeds (or, if configured, always fails) and
/// returns a deterministic transaction id derived from the outputs.
pub struct MockSigner {
    fail: bool,
}

impl MockSigner {
    pub fn new() -> Self {
        MockSigner { fail: false }
    }

    pub fn failing() -> Self {
        MockSigner { fail: true }
    }
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Signer for MockSigner {
    async fn sign(
        &self,
        outputs: &[PaymentOutput],
        _utxos: &[UtxoEntry],
        _fee_estimate: FeeEstimate,
    ) -> Result<SignedTransaction, NodeError> {
        if self.fail {
            return Err(NodeError::Signing("mock signer configured to fail".into()));
        }
        let mut id = [0u8; 32];
        let total: u64 = outputs.iter().map(|o| o.amount).sum();
        id[..8].copy_from_slice(&total.to_le_bytes());
        Ok(SignedTransaction {
            id,
            raw: total.to_le_bytes().to_vec(),
        })
    }
}

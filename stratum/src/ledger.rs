//! The nonce-dedup set and per-block contribution accumulator (spec §3
//! "Nonce-dedup set" / "Contribution"). Drained atomically — snapshot and
//! clear — whenever a block is recorded, so concurrent submitters never see
//! a half-drained state.

use kpool_store::Contribution;
use kpool_util::Difficulty;
use std::collections::HashSet;
use tokio::sync::Mutex;

#[derive(Default)]
struct LedgerState {
    nonces: HashSet<u64>,
    contributions: Vec<Contribution>,
}

#[derive(Default)]
pub struct ShareLedger {
    state: Mutex<LedgerState>,
}

impl ShareLedger {
    pub fn new() -> Self {
        ShareLedger::default()
    }

    /// Returns `true` if `nonce` was already recorded (a duplicate share).
    pub async fn seen_or_record(&self, nonce: u64) -> bool {
        let mut state = self.state.lock().await;
        !state.nonces.insert(nonce)
    }

    pub async fn record_contribution(&self, address: String, difficulty: Difficulty) {
        let mut state = self.state.lock().await;
        state.contributions.push(Contribution { address, difficulty });
    }

    /// Snapshot and clear, for handing a block's full contribution list to
    /// the orchestrator (spec §4.E.1 step 1).
    pub async fn drain(&self) -> Vec<Contribution> {
        let mut state = self.state.lock().await;
        state.nonces.clear();
        std::mem::take(&mut state.contributions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn duplicate_nonce_is_flagged() {
        let ledger = ShareLedger::new();
        assert!(!ledger.seen_or_record(1).await);
        assert!(ledger.seen_or_record(1).await);
    }

    #[tokio::test]
    async fn drain_clears_nonces_and_contributions() {
        let ledger = ShareLedger::new();
        ledger.seen_or_record(1).await;
        ledger
            .record_contribution("addr1".into(), Difficulty::new(Decimal::from(100)))
            .await;

        let drained = ledger.drain().await;
        assert_eq!(drained.len(), 1);
        assert!(!ledger.seen_or_record(1).await);
    }
}

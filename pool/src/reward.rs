//! In-memory PPLNS aggregation and the reward-distribution fold (spec
//! §4.E.4). Kept as exact-decimal arithmetic throughout: work is a sum of
//! [`Difficulty`] values, never a float, so the payout split can be proven
//! to sum to the matured amount up to rounding (spec §9).

use std::collections::HashMap;

use kpool_node::{BlockColor, Hash, NodeClient};
use kpool_store::Contribution;
use num_traits::ToPrimitive;
use rust_decimal::Decimal;

/// One block's worth of still-unpaid contribution, aggregated by address.
#[derive(Debug, Default, Clone)]
pub struct BlockWork {
    pub contributors: HashMap<String, Decimal>,
    pub total_work: Decimal,
    pub daa_score: u64,
}

impl BlockWork {
    pub fn from_contributions(contributions: &[Contribution], daa_score: u64) -> Self {
        let mut work = BlockWork {
            daa_score,
            ..Default::default()
        };
        for contribution in contributions {
            *work.contributors.entry(contribution.address.clone()).or_insert(Decimal::ZERO) += contribution.difficulty.0;
            work.total_work += contribution.difficulty.0;
        }
        work
    }
}

/// The in-memory reward state: unpaid blocks' aggregated work, in the order
/// they were recorded. Restart recovery reinstates this from the Store only
/// when it is empty (spec §9 "restore only when in-memory state is empty,
/// to prevent double-crediting").
#[derive(Debug, Default)]
pub struct RewardState {
    blocks: HashMap<String, BlockWork>,
    order: Vec<String>,
}

impl RewardState {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn insert(&mut self, hash_hex: String, work: BlockWork) {
        if !self.blocks.contains_key(&hash_hex) {
            self.order.push(hash_hex.clone());
        }
        self.blocks.insert(hash_hex, work);
    }

    pub fn remove_all(&mut self, hashes: &[String]) {
        for hash in hashes {
            self.blocks.remove(hash);
        }
        self.order.retain(|h| !hashes.contains(h));
    }
}

/// Decodes a hex block hash as stored in [`kpool_store::BlockRecord`] back
/// into the 32-byte form the node trait speaks.
pub fn decode_hash(hash_hex: &str) -> Option<Hash> {
    let bytes = hex::decode(hash_hex).ok()?;
    bytes.try_into().ok()
}

/// Folds unpaid blocks in arrival order into a running `contributors` map
/// and `accumulated_work` total, stopping after the first block the node
/// reports as blue (spec §4.E.4 step 1). Returns the folded contributors,
/// the accumulated work, and the list of block hashes consumed by the fold
/// — the caller marks exactly these paid once their share has been
/// credited.
pub async fn fold_unpaid_work(
    node: &dyn NodeClient,
    state: &RewardState,
) -> (HashMap<String, Decimal>, Decimal, Vec<String>) {
    let mut contributors: HashMap<String, Decimal> = HashMap::new();
    let mut accumulated = Decimal::ZERO;
    let mut consumed = Vec::new();

    for hash_hex in &state.order {
        let Some(work) = state.blocks.get(hash_hex) else { continue };
        for (address, share) in &work.contributors {
            *contributors.entry(address.clone()).or_insert(Decimal::ZERO) += *share;
        }
        accumulated += work.total_work;
        consumed.push(hash_hex.clone());

        let Some(hash) = decode_hash(hash_hex) else { continue };
        if matches!(node.get_current_block_color(&hash).await, Ok(BlockColor::Blue)) {
            break;
        }
    }

    (contributors, accumulated, consumed)
}

/// `share = floor(work / total * amount)`, computed as `floor(work *
/// amount / total)` to keep the one division at the end (spec §9
/// "Arbitrary-precision decimals").
pub fn floor_share(work: Decimal, total: Decimal, amount: u64) -> u64 {
    if total.is_zero() {
        return 0;
    }
    let share = (work * Decimal::from(amount) / total).floor();
    share.to_u64().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_share_matches_worked_example() {
        // S3 from the spec: H1 contributes A=100,B=300 (total 400); H2
        // contributes A=200 (total 200); accumulated=600, A=600.
        let mut contributors = HashMap::new();
        contributors.insert("a".to_string(), Decimal::from(300));
        contributors.insert("b".to_string(), Decimal::from(300));
        let total = Decimal::from(600);

        let a = floor_share(contributors["a"], total, 600);
        let b = floor_share(contributors["b"], total, 600);
        assert_eq!(a, 300);
        assert_eq!(b, 300);
        assert_eq!(a + b, 600);
    }

    #[test]
    fn reward_state_tracks_arrival_order_and_removal() {
        let mut state = RewardState::default();
        state.insert("h1".into(), BlockWork::default());
        state.insert("h2".into(), BlockWork::default());
        assert_eq!(state.order, vec!["h1", "h2"]);
        state.remove_all(&["h1".to_string()]);
        assert!(!state.blocks.contains_key("h1"));
        assert_eq!(state.order, vec!["h2"]);
    }
}

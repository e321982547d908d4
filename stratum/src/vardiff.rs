//! Per-session variable-difficulty controller (spec §4.C.5). Nudges a
//! session's difficulty toward a target share interval without ever
//! touching a float for the difficulty value itself.

use kpool_util::Difficulty;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VardiffConfig {
    pub min_difficulty: Difficulty,
    pub max_difficulty: Difficulty,
    pub target_time_secs: u64,
    pub variance_percent: u64,
    pub max_change: Decimal,
    pub change_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct VardiffState {
    pub last_share_at: u64,
    pub last_change_at: u64,
    pub current_difficulty: Difficulty,
    pub share_count: u64,
}

impl VardiffState {
    pub fn new(starting_difficulty: Difficulty, now: u64) -> Self {
        VardiffState {
            last_share_at: now,
            last_change_at: now,
            current_difficulty: starting_difficulty,
            share_count: 0,
        }
    }

    /// Call on every accepted share. Returns `Some(new_difficulty)` when an
    /// adjustment should be pushed to the session as `mining.set_difficulty`.
    pub fn on_share(&mut self, config: &VardiffConfig, now: u64) -> Option<Difficulty> {
        let delta = now.saturating_sub(self.last_share_at);
        self.last_share_at = now;
        self.share_count += 1;

        if now.saturating_sub(self.last_change_at) < config.change_interval_secs || self.share_count < 2 {
            return None;
        }

        let target = Decimal::from(config.target_time_secs);
        let variance = Decimal::from(config.variance_percent) / Decimal::from(100u64);
        let min_target = target * (Decimal::ONE - variance);
        let max_target = target * (Decimal::ONE + variance);
        let delta_dec = Decimal::from(delta.max(1));

        let current = self.current_difficulty.0;
        let new_diff = if delta_dec < min_target {
            let ratio = (target / delta_dec).min(config.max_change);
            current * ratio
        } else if delta_dec > max_target {
            let capped = delta_dec.min(Decimal::from(300u64));
            let weight = capped / Decimal::from(300u64);
            let ratio = (target / delta_dec).max(Decimal::ONE / config.max_change);
            current * ratio * weight
        } else {
            return None;
        };

        let clamped = Difficulty::new(new_diff).clamp(config.min_difficulty, config.max_difficulty);

        let fractional_change = if current.is_zero() {
            Decimal::ONE
        } else {
            ((clamped.0 - current) / current).abs()
        };
        if fractional_change <= Decimal::new(5, 2) {
            return None;
        }

        self.current_difficulty = clamped;
        self.last_change_at = now;
        Some(clamped)
    }
}

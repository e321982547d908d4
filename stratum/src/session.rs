//! Per-connection session state (spec §3 "Session"). Owned exclusively by
//! the connection task that created it — never shared or locked, which is
//! what lets per-session message processing stay strictly sequential
//! without any cross-task coordination.

use crate::dialect::Dialect;
use crate::vardiff::VardiffState;
use kpool_util::Difficulty;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Subscribed,
    Authorized,
    Working,
}

/// A worker identity: canonical pool address plus the worker name reported
/// alongside it.
pub type WorkerId = (String, String);

pub struct Session {
    pub id: u64,
    pub extranonce: [u8; 2],
    pub dialect: Dialect,
    pub user_agent: String,
    pub difficulty: Difficulty,
    pub workers: HashSet<WorkerId>,
    pub state: SessionState,
    pub subscribed: bool,
    pub connected_at: u64,
    pub message_count: u64,
    pub vardiff: Option<VardiffState>,
}

impl Session {
    pub fn new(id: u64, extranonce: [u8; 2], starting_difficulty: Difficulty, now: u64) -> Self {
        Session {
            id,
            extranonce,
            dialect: Dialect::Standard,
            user_agent: String::new(),
            difficulty: starting_difficulty,
            workers: HashSet::new(),
            state: SessionState::Connected,
            subscribed: false,
            connected_at: now,
            message_count: 0,
            vardiff: None,
        }
    }

    pub fn extranonce_hex(&self) -> String {
        hex::encode(self.extranonce)
    }

    pub fn is_authorized_worker(&self, identity: &WorkerId) -> bool {
        self.workers.contains(identity)
    }

    pub fn enter_working(&mut self) {
        if self.state == SessionState::Authorized {
            self.state = SessionState::Working;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn fresh_session_starts_connected_and_unsubscribed() {
        let session = Session::new(1, [0xAB, 0xCD], Difficulty::new(Decimal::from(1024)), 0);
        assert_eq!(session.state, SessionState::Connected);
        assert!(!session.subscribed);
        assert_eq!(session.extranonce_hex(), "abcd");
    }

    #[test]
    fn working_transition_requires_authorized_first() {
        let mut session = Session::new(1, [0, 0], Difficulty::new(Decimal::from(1)), 0);
        session.enter_working();
        assert_eq!(session.state, SessionState::Connected);

        session.state = SessionState::Authorized;
        session.enter_working();
        assert_eq!(session.state, SessionState::Working);
    }
}

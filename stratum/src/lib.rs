//! Stratum-over-TCP mining pool front end (spec §4.C): dialect detection,
//! the per-session state machine, variable-difficulty adjustment, the
//! nonce-dedup share ledger, and the connection-handling TCP server.
//!
//! This crate never talks to the node or the store directly beyond what it
//! needs to validate and record shares — template lookup goes through
//! [`kpool_templates::TemplateManager`], and the only thing this crate hands
//! back to the orchestrator is a [`PoolEvent`] over a channel.

mod dialect;
mod ledger;
mod protocol;
mod server;
mod session;
mod vardiff;

pub use dialect::Dialect;
pub use ledger::ShareLedger;
pub use protocol::{Notification, Request, Response, StratumError};
pub use server::{
    PoolEvent, StratumConfig, StratumServer, BUFFER_LIMIT_BYTES, IDLE_TIMEOUT,
    RATE_LIMIT_MAX_MESSAGES, RATE_LIMIT_WINDOW_SECS,
};
pub use session::{Session, SessionState, WorkerId};
pub use vardiff::{VardiffConfig, VardiffState};

//! Address canonicalization for the pool's miner-facing boundary.
//!
//! External RPCs and the Stratum wire protocol accept addresses with a
//! `kaspa:`/`kaspatest:` network prefix; the Store keys everything on the
//! stripped, lower-cased canonical form. Every boundary crossing goes
//! through [`canonicalize`] or [`externalize`] so the two forms never leak
//! into each other by accident (spec §9 "Address/prefix policy").

use thiserror::Error;

/// Prefix used when externalizing a canonical address for mainnet-style
/// read APIs. Testnet prefixes are accepted on input but not re-applied on
/// output; this pool instance only ever serves one network at a time.
pub const EXTERNAL_PREFIX: &str = "kaspa:";

const KNOWN_PREFIXES: &[&str] = &["kaspa:", "kaspatest:"];

/// The reserved key under which the pool's own fee revenue is recorded in
/// the `miners` sub-domain. Never returned from `getAllMiners`.
pub const POOL_REVENUE_KEY: &str = "me";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
}

/// Strip any recognized network prefix and lower-case the remainder.
///
/// Both `X` and `kaspa:X` (or `kaspatest:X`) are accepted; the result is
/// the single canonical form the Store and Session worker-sets key on.
pub fn canonicalize(address: &str) -> Result<String, AddressError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }

    let stripped = KNOWN_PREFIXES
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);

    if stripped.is_empty() {
        return Err(AddressError::Empty);
    }

    Ok(stripped.to_lowercase())
}

/// Re-attach the network prefix for external read APIs. `addr` is assumed
/// already canonical (i.e. produced by [`canonicalize`]).
pub fn externalize(canonical_addr: &str) -> String {
    format!("{EXTERNAL_PREFIX}{canonical_addr}")
}

/// Split a Stratum worker identity `"<address>.<worker>"` on the *first*
/// dot, since worker names are allowed to contain dots themselves.
pub fn split_identity(identity: &str) -> Option<(&str, &str)> {
    identity.split_once('.')
}

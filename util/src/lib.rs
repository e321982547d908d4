//! Small, dependency-light helpers shared across the kpool workspace:
//! address canonicalization, fixed-point difficulty/target arithmetic, and
//! timestamp formatting. Kept deliberately free of any Stratum, Store or
//! Treasury types so every other crate can depend on it without a cycle.

use thiserror::Error;

pub mod address;
pub mod decimal;
pub mod serde_amount;
pub mod time;

pub use address::{
    canonicalize, externalize, split_identity, AddressError, EXTERNAL_PREFIX, POOL_REVENUE_KEY,
};
pub use decimal::{Difficulty, Target};
pub use time::{format_timestamp, now_secs};

#[derive(Error, Debug)]
pub enum UtilError {
    #[error("hex decoding error: {0}")]
    HexError(#[from] hex::FromHexError),

    #[error("base58 decoding error: {0}")]
    Base58Error(#[from] bs58::decode::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

/// Converts a hex string to bytes.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, UtilError> {
    Ok(hex::decode(hex)?)
}

/// Converts bytes to a hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Converts a base58 string to bytes.
pub fn base58_to_bytes(b58: &str) -> Result<Vec<u8>, UtilError> {
    Ok(bs58::decode(b58).into_vec()?)
}

/// Converts bytes to a base58 string.
pub fn bytes_to_base58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

//! Pool configuration, loaded from TOML via the `config` crate (spec §6
//! "External interfaces / configuration"). Every key in the table spec §6
//! lists has a field here; the rest (`log`, `data_dir`) are the ambient
//! knobs needed to actually run the binary that the distilled spec leaves
//! unspecified.

use std::net::SocketAddr;
use std::path::PathBuf;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid difficulty string {0:?}")]
    InvalidDifficulty(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreasurySection {
    #[serde(rename = "privateKey")]
    pub private_key: String,
    pub fee: f64,
    pub rewarding: RewardingSection,
    /// Maturity window in DAA blocks before a coinbase UTXO is spendable.
    #[serde(default = "default_coinbase_maturity_daa")]
    pub coinbase_maturity_daa: u64,
}

fn default_coinbase_maturity_daa() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardingSection {
    #[serde(rename = "paymentThreshold")]
    pub payment_threshold: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplatesSection {
    pub identity: String,
    #[serde(rename = "daaWindow")]
    pub daa_window: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VardiffSection {
    pub enabled: bool,
    #[serde(rename = "minDifficulty")]
    pub min_difficulty: String,
    #[serde(rename = "maxDifficulty")]
    pub max_difficulty: String,
    #[serde(rename = "targetTime")]
    pub target_time: u64,
    #[serde(rename = "variancePercent")]
    pub variance_percent: u64,
    #[serde(rename = "maxChange")]
    pub max_change: Decimal,
    #[serde(rename = "changeInterval")]
    pub change_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StratumSection {
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub port: u16,
    pub difficulty: String,
    pub vardiff: Option<VardiffSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    /// Connection string for the upstream node. The bundled `kpool-node`
    /// ships only a trait plus a deterministic mock (spec §1 non-goal: the
    /// node's own wire protocol is not designed here), so this field is
    /// read but not yet dialed by anything other than the mock.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfigFile {
    pub node: NodeSection,
    pub treasury: TreasurySection,
    pub templates: TemplatesSection,
    pub stratum: StratumSection,
    pub api: ApiSection,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl PoolConfigFile {
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("data_dir", "./data")?
            .set_default("api.enabled", false)?
            .set_default("api.port", 8080)?;
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("KPOOL").separator("__"));
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn stratum_bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.stratum.host_name, self.stratum.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.stratum.port)))
    }

    pub fn api_bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.api.port))
    }

    pub fn fee_bps(&self) -> u32 {
        (self.treasury.fee * 100.0).round() as u32
    }
}

pub fn parse_difficulty(value: &str) -> Result<Decimal, ConfigError> {
    value
        .parse::<Decimal>()
        .map_err(|_| ConfigError::InvalidDifficulty(value.to_string()))
}

//! kpool entry point: loads configuration, wires Store, TemplateManager,
//! StratumServer, Treasury and the Pool orchestrator together, and starts
//! the optional read-only API.

mod config;

use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;

use kpool_api::{ApiConfig, ApiContext, ApiServer};
use kpool_node::{MockNodeClient, MockSigner, NodeClient, Signer};
use kpool_pool::Pool;
use kpool_store::{JsonStore, Store};
use kpool_stratum::{StratumConfig, StratumServer, VardiffConfig};
use kpool_templates::TemplateManager;
use kpool_treasury::{Treasury, TreasuryConfig};
use kpool_util::{now_secs, Difficulty};

use config::PoolConfigFile;

#[derive(Parser)]
#[clap(name = "kpool")]
#[clap(about = "A Stratum mining pool server for post-Crescendo Kaspa-style proof-of-work networks")]
struct Cli {
    /// Path to the pool's TOML configuration file.
    #[clap(short, long, value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Verbosity level (0-4): error, warn, info, debug, trace.
    #[clap(short, long, default_value = "2")]
    verbosity: u8,
}

fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    let cfg = match PoolConfigFile::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = run(cfg).await {
        error!("kpool exited with error: {err}");
        process::exit(1);
    }
}

async fn run(cfg: PoolConfigFile) -> Result<(), Box<dyn std::error::Error>> {
    info!("starting kpool, data dir {}", cfg.data_dir.display());

    let store: Arc<dyn Store> = Arc::new(JsonStore::new(cfg.data_dir.clone()).await?);

    // The node's own wire protocol and wallet key material are explicit
    // non-goals (spec §1); both collaborators are consumed only through
    // their trait boundary, backed here by the deterministic mock until a
    // real node/wallet integration is substituted behind `NodeClient`/
    // `Signer`.
    let node: Arc<dyn NodeClient> = Arc::new(MockNodeClient::new());
    let signer: Arc<dyn Signer> = Arc::new(MockSigner::new());
    info!("node RPC target configured as {} (served by the in-process mock)", cfg.node.url);

    let templates = Arc::new(TemplateManager::new(node.clone(), cfg.templates.daa_window));
    let announcements = templates.register().await?;

    let starting_difficulty = Difficulty::new(config::parse_difficulty(&cfg.stratum.difficulty)?);
    let vardiff = match &cfg.stratum.vardiff {
        Some(v) if v.enabled => Some(VardiffConfig {
            min_difficulty: Difficulty::new(config::parse_difficulty(&v.min_difficulty)?),
            max_difficulty: Difficulty::new(config::parse_difficulty(&v.max_difficulty)?),
            target_time_secs: v.target_time,
            variance_percent: v.variance_percent,
            max_change: v.max_change,
            change_interval_secs: v.change_interval,
        }),
        _ => None,
    };

    let (pool_events_tx, pool_events_rx) = mpsc::channel(1024);
    let stratum_config = StratumConfig {
        bind_addr: cfg.stratum_bind_addr(),
        starting_difficulty,
        vardiff,
    };
    let stratum = StratumServer::new(stratum_config, templates.clone(), pool_events_tx);
    let stratum_for_run = Arc::clone(&stratum);
    tokio::spawn(async move {
        if let Err(err) = stratum_for_run.run(announcements).await {
            error!("stratum server stopped: {err}");
        }
    });

    let treasury_config = TreasuryConfig {
        funding_address: kpool_util::canonicalize(&cfg.treasury.private_key)
            .unwrap_or_else(|_| cfg.treasury.private_key.clone()),
        fee_bps: cfg.fee_bps(),
        coinbase_maturity_daa: cfg.treasury.coinbase_maturity_daa,
        process_start_time: now_secs(),
    };
    let treasury = Treasury::new(node.clone(), signer, treasury_config);
    let treasury_events_rx = treasury.watch().await?;

    let pool = Pool::new(
        store.clone(),
        node.clone(),
        treasury,
        kpool_pool::PoolConfig {
            default_payment_threshold: cfg.treasury.rewarding.payment_threshold,
        },
    );
    let pool_for_run = Arc::clone(&pool);
    tokio::spawn(async move {
        pool_for_run.run(pool_events_rx, treasury_events_rx).await;
    });

    if cfg.api.enabled {
        let api_server = ApiServer::new(
            ApiConfig { bind_addr: cfg.api_bind_addr() },
            ApiContext { store: store.clone() },
        );
        tokio::spawn(async move {
            if let Err(err) = api_server.start().await {
                error!("api server stopped: {err}");
            }
        });
    }

    info!("kpool running; stratum on {}", cfg.stratum_bind_addr());
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    Ok(())
}

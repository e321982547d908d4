//! End-to-end exercise of the Stratum server over a real TCP socket,
//! covering the seed scenarios from spec §8: subscribe ordering (S1),
//! duplicate-share rejection (S1), the block-found path (S2), and Bitmain
//! dialect detection (S6).

use std::sync::Arc;
use std::time::Duration;

use kpool_node::{
    BlockAddedReceiver, BlockColor, BlockInfo, BlockTemplate, FeeEstimate, Hash,
    MaturityReceiver, MockNodeClient, MockPow, NodeClient, NodeError, PowVerifier,
    SignedTransaction, TemplateReceiver, UtxoEntry,
};
use kpool_stratum::{PoolEvent, StratumConfig, StratumServer, VardiffConfig};
use kpool_templates::{TemplateManager, DEFAULT_WINDOW};
use kpool_util::{Difficulty, Target};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Wraps [`MockNodeClient`] but mints a [`MockPow`] programmed to report a
/// block for one pre-agreed nonce, so a test can drive spec §4.C.3 step 6
/// (the block path) without a real PoW implementation.
struct BlockReadyNode {
    inner: Arc<MockNodeClient>,
    block_nonce: u64,
}

#[async_trait::async_trait]
impl NodeClient for BlockReadyNode {
    async fn get_block_template(&self, extra_data: &str) -> Result<BlockTemplate, NodeError> {
        self.inner.get_block_template(extra_data).await
    }

    fn make_verifier(&self, template: &BlockTemplate) -> Box<dyn PowVerifier> {
        Box::new(
            MockPow::new(template.payload.clone())
                .with_answer(self.block_nonce, true, Target::from_bytes_be([0u8; 32])),
        )
    }

    async fn submit_block(&self, payload: Vec<u8>) -> Result<(), NodeError> {
        self.inner.submit_block(payload).await
    }

    async fn get_block(&self, hash: &Hash) -> Result<Option<BlockInfo>, NodeError> {
        self.inner.get_block(hash).await
    }

    async fn get_current_block_color(&self, hash: &Hash) -> Result<BlockColor, NodeError> {
        self.inner.get_current_block_color(hash).await
    }

    async fn get_daa_score_timestamp_estimate(&self, daa_score: u64) -> Result<u64, NodeError> {
        self.inner.get_daa_score_timestamp_estimate(daa_score).await
    }

    async fn get_fee_estimate(&self) -> Result<FeeEstimate, NodeError> {
        self.inner.get_fee_estimate().await
    }

    async fn get_utxos_by_addresses(&self, addresses: &[String]) -> Result<Vec<UtxoEntry>, NodeError> {
        self.inner.get_utxos_by_addresses(addresses).await
    }

    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<(), NodeError> {
        self.inner.submit_transaction(tx).await
    }

    async fn subscribe_new_block_template(&self) -> Result<TemplateReceiver, NodeError> {
        self.inner.subscribe_new_block_template().await
    }

    async fn subscribe_block_added(&self) -> Result<BlockAddedReceiver, NodeError> {
        self.inner.subscribe_block_added().await
    }

    async fn subscribe_utxo_maturity(&self, funding_address: &str) -> Result<MaturityReceiver, NodeError> {
        self.inner.subscribe_utxo_maturity(funding_address).await
    }
}

async fn connect_with_retry(addr: &str) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("could not connect to {addr}");
}

async fn send_line(write_half: &mut OwnedWriteHalf, value: Value) {
    let mut line = serde_json::to_string(&value).unwrap();
    line.push('\n');
    write_half.write_all(line.as_bytes()).await.unwrap();
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> Value {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a response line")
        .unwrap();
    serde_json::from_str(line.trim()).unwrap()
}

/// S1 (basic happy path): subscribe ordering, authorize, one accepted share,
/// then the same share rejected as a duplicate.
#[tokio::test]
async fn s1_basic_happy_path() {
    let bind_addr = "127.0.0.1:19301";
    let node: Arc<dyn NodeClient> = Arc::new(MockNodeClient::new());
    let templates = Arc::new(TemplateManager::new(node, DEFAULT_WINDOW));
    let announcements = templates.register().await.unwrap();

    let (events_tx, mut events_rx) = mpsc::channel::<PoolEvent>(8);
    let config = StratumConfig {
        bind_addr: bind_addr.parse().unwrap(),
        starting_difficulty: Difficulty::new(Decimal::from(4096)),
        vardiff: None,
    };
    let server = StratumServer::new(config, templates, events_tx);
    tokio::spawn(server.run(announcements));

    let stream = connect_with_retry(bind_addr).await;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    send_line(
        &mut write_half,
        json!({"id": 1, "method": "mining.subscribe", "params": ["IceRiverMiner-v1.1"]}),
    )
    .await;
    let subscribe_response = read_line(&mut reader).await;
    assert_eq!(subscribe_response["result"], json!([true, "EthereumStratum/1.0.0"]));

    let set_extranonce = read_line(&mut reader).await;
    assert_eq!(set_extranonce["method"], "set_extranonce");
    let extranonce_hex = set_extranonce["params"][0].as_str().unwrap().to_string();
    assert_eq!(extranonce_hex.len(), 4, "extranonce is 2 bytes / 4 hex chars");

    let set_difficulty = read_line(&mut reader).await;
    assert_eq!(set_difficulty["method"], "mining.set_difficulty");
    assert_eq!(set_difficulty["params"][0], json!(4096.0));

    send_line(
        &mut write_half,
        json!({"id": 2, "method": "mining.authorize", "params": ["kaspa:qrdxalpha.worker1", ""]}),
    )
    .await;
    let authorize_response = read_line(&mut reader).await;
    assert_eq!(authorize_response["result"], json!(true));

    let raw_nonce = "000000000000";
    assert_eq!(format!("{extranonce_hex}{raw_nonce}").len(), 16);

    send_line(
        &mut write_half,
        json!({"id": 3, "method": "mining.submit", "params": ["kaspa:qrdxalpha.worker1", "0000", raw_nonce]}),
    )
    .await;
    let submit_response = read_line(&mut reader).await;
    assert_eq!(submit_response["result"], json!(true));
    assert!(submit_response["error"].is_null());

    send_line(
        &mut write_half,
        json!({"id": 4, "method": "mining.submit", "params": ["kaspa:qrdxalpha.worker1", "0000", raw_nonce]}),
    )
    .await;
    let duplicate_response = read_line(&mut reader).await;
    assert_eq!(duplicate_response["error"][0], json!(22), "resubmitting the same nonce is error 22");

    assert!(
        events_rx.try_recv().is_err(),
        "a non-winning share must not raise a block event"
    );
}

/// S2 (block): a submitted share whose PoW verifier reports a block yields
/// a persisted-contribution block event carrying the node-canonical hash.
#[tokio::test]
async fn s2_block_found() {
    let bind_addr = "127.0.0.1:19302";

    // Session ids are minted sequentially from 1 per fresh server; this is
    // the only connection this test makes, so its extranonce is
    // deterministic ([0, 1] -> "0001").
    let extranonce_hex = "0001";
    let raw_nonce = "0102030405af";
    let padded = format!("{extranonce_hex}{raw_nonce}");
    let nonce_bytes = hex::decode(&padded).unwrap();
    let block_nonce = u64::from_be_bytes(nonce_bytes.try_into().unwrap());

    let inner = Arc::new(MockNodeClient::new());
    inner.insert_block(
        [0u8; 32],
        BlockInfo {
            hash: [9u8; 32],
            daa_score: 5,
            coinbase_tx_id: None,
            coinbase_outputs: vec![],
        },
        BlockColor::Blue,
    );
    let node: Arc<dyn NodeClient> = Arc::new(BlockReadyNode { inner, block_nonce });
    let templates = Arc::new(TemplateManager::new(node, DEFAULT_WINDOW));
    let announcements = templates.register().await.unwrap();

    let (events_tx, mut events_rx) = mpsc::channel::<PoolEvent>(8);
    let config = StratumConfig {
        bind_addr: bind_addr.parse().unwrap(),
        starting_difficulty: Difficulty::new(Decimal::from(4096)),
        vardiff: None,
    };
    let server = StratumServer::new(config, templates, events_tx);
    tokio::spawn(server.run(announcements));

    let stream = connect_with_retry(bind_addr).await;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    send_line(
        &mut write_half,
        json!({"id": 1, "method": "mining.subscribe", "params": ["IceRiverMiner-v1.1"]}),
    )
    .await;
    let subscribe_response = read_line(&mut reader).await;
    assert_eq!(subscribe_response["result"], json!([true, "EthereumStratum/1.0.0"]));
    let set_extranonce = read_line(&mut reader).await;
    assert_eq!(set_extranonce["params"][0], json!(extranonce_hex));
    let _set_difficulty = read_line(&mut reader).await;

    send_line(
        &mut write_half,
        json!({"id": 2, "method": "mining.authorize", "params": ["kaspa:qrdxalpha.worker1", ""]}),
    )
    .await;
    let authorize_response = read_line(&mut reader).await;
    assert_eq!(authorize_response["result"], json!(true));

    send_line(
        &mut write_half,
        json!({"id": 3, "method": "mining.submit", "params": ["kaspa:qrdxalpha.worker1", "0000", raw_nonce]}),
    )
    .await;
    let submit_response = read_line(&mut reader).await;
    assert_eq!(submit_response["result"], json!(true));

    let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("timed out waiting for a block event")
        .expect("event channel closed");
    match event {
        PoolEvent::BlockFound { hash, finder, contributions } => {
            assert_eq!(hash, [9u8; 32], "the node-canonical hash must be used, not the local one");
            assert_eq!(finder.address, "qrdxalpha");
            assert_eq!(finder.difficulty.0, Decimal::from(4096));
            assert!(
                contributions.is_empty(),
                "the finder's own contribution is appended by the Pool orchestrator, not Stratum"
            );
        }
    }
}

/// S6 (Bitmain subscribe): a Bitmain-family user-agent gets the
/// `[null, extranonce, 8 - len/2]` shape on both the subscribe result and
/// the `set_extranonce` notification.
#[tokio::test]
async fn s6_bitmain_subscribe() {
    let bind_addr = "127.0.0.1:19303";
    let node: Arc<dyn NodeClient> = Arc::new(MockNodeClient::new());
    let templates = Arc::new(TemplateManager::new(node, DEFAULT_WINDOW));
    let announcements = templates.register().await.unwrap();

    let (events_tx, _events_rx) = mpsc::channel::<PoolEvent>(8);
    let config = StratumConfig {
        bind_addr: bind_addr.parse().unwrap(),
        starting_difficulty: Difficulty::new(Decimal::from(4096)),
        vardiff: None,
    };
    let server = StratumServer::new(config, templates, events_tx);
    tokio::spawn(server.run(announcements));

    let stream = connect_with_retry(bind_addr).await;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    send_line(
        &mut write_half,
        json!({"id": 1, "method": "mining.subscribe", "params": ["GodMiner/1.0"]}),
    )
    .await;
    let subscribe_response = read_line(&mut reader).await;
    let result = subscribe_response["result"].as_array().unwrap();
    assert!(result[0].is_null());
    let extranonce_hex = result[1].as_str().unwrap().to_string();
    assert_eq!(extranonce_hex.len(), 4);
    assert_eq!(result[2], json!(8 - (extranonce_hex.len() / 2) as i64));

    let set_extranonce = read_line(&mut reader).await;
    assert_eq!(set_extranonce["method"], "set_extranonce");
    assert_eq!(
        set_extranonce["params"],
        json!([extranonce_hex, 8 - (extranonce_hex.len() / 2) as i64])
    );
}

/// A rejected submit (here, `job-not-found`) must not perturb the vardiff
/// controller's timing state (spec §4.C.5 "On each accepted share"):
/// two rejected submits sent back-to-back must not trigger a
/// `mining.set_difficulty` push, even with `changeInterval` set to zero so
/// any accepted share would trigger one immediately.
#[tokio::test]
async fn rejected_submit_does_not_drive_vardiff() {
    let bind_addr = "127.0.0.1:19304";
    let node: Arc<dyn NodeClient> = Arc::new(MockNodeClient::new());
    let templates = Arc::new(TemplateManager::new(node, DEFAULT_WINDOW));
    let announcements = templates.register().await.unwrap();

    let (events_tx, _events_rx) = mpsc::channel::<PoolEvent>(8);
    let config = StratumConfig {
        bind_addr: bind_addr.parse().unwrap(),
        starting_difficulty: Difficulty::new(Decimal::from(4096)),
        vardiff: Some(VardiffConfig {
            min_difficulty: Difficulty::new(Decimal::from(16)),
            max_difficulty: Difficulty::new(Decimal::from(1_000_000)),
            target_time_secs: 10,
            variance_percent: 20,
            max_change: Decimal::from(4),
            change_interval_secs: 0,
        }),
    };
    let server = StratumServer::new(config, templates, events_tx);
    tokio::spawn(server.run(announcements));

    let stream = connect_with_retry(bind_addr).await;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    send_line(
        &mut write_half,
        json!({"id": 1, "method": "mining.subscribe", "params": ["IceRiverMiner-v1.1"]}),
    )
    .await;
    let _subscribe_response = read_line(&mut reader).await;
    let _set_extranonce = read_line(&mut reader).await;
    let _set_difficulty = read_line(&mut reader).await;

    send_line(
        &mut write_half,
        json!({"id": 2, "method": "mining.authorize", "params": ["kaspa:qrdxalpha.worker1", ""]}),
    )
    .await;
    let _authorize_response = read_line(&mut reader).await;

    // Two submits referencing a job id the template window never minted:
    // both are rejected `job-not-found`, never reaching the vardiff call.
    for id in [3, 4] {
        send_line(
            &mut write_half,
            json!({"id": id, "method": "mining.submit", "params": ["kaspa:qrdxalpha.worker1", "ffff", "000000000000"]}),
        )
        .await;
        let response = read_line(&mut reader).await;
        assert_eq!(response["error"][0], json!(21), "unminted job id must be job-not-found");
    }

    // Nothing further should arrive: no mining.set_difficulty push from the
    // two rejected submits above.
    let mut stray = String::new();
    let timed_out = tokio::time::timeout(Duration::from_millis(200), reader.read_line(&mut stray)).await;
    assert!(
        timed_out.is_err(),
        "expected no further notification, got: {stray:?}"
    );
}

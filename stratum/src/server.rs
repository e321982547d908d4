//! The TCP listener and per-connection state machine (spec §4.C). Message
//! processing within a connection is a plain sequential `async` loop: there
//! is no lock to take and no concurrent mutation of a session's own state,
//! which is what keeps responses ordered without extra bookkeeping.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kpool_node::PowVerifier;
use kpool_store::Contribution;
use kpool_templates::{Announcement, TemplateManager};
use kpool_util::{Difficulty, Target};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::dialect::{self, Dialect};
use crate::ledger::ShareLedger;
use crate::protocol::{Notification, Request, Response, StratumError};
use crate::session::{Session, SessionState, WorkerId};
use crate::vardiff::VardiffConfig;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const BUFFER_LIMIT_BYTES: usize = 8 * 1024;
pub const RATE_LIMIT_WINDOW_SECS: u64 = 10;
pub const RATE_LIMIT_MAX_MESSAGES: u32 = 100 * 10;

#[derive(Debug, Clone)]
pub struct StratumConfig {
    pub bind_addr: SocketAddr,
    pub starting_difficulty: Difficulty,
    pub vardiff: Option<VardiffConfig>,
}

/// What Stratum reports to the orchestrator when a share turns out to be a
/// block (spec §3 data-flow: "Miner → C (share) → if block, C → ... → E").
/// The only coupling between Pool and Stratum: a closed enum over a
/// channel, never shared mutable state (spec §9 "Event-style coupling").
#[derive(Debug, Clone)]
pub enum PoolEvent {
    BlockFound {
        hash: [u8; 32],
        finder: Contribution,
        contributions: Vec<Contribution>,
    },
}

struct SubscriberEntry {
    sender: mpsc::Sender<String>,
    dialect: Dialect,
}

pub struct StratumServer {
    config: StratumConfig,
    templates: Arc<TemplateManager>,
    ledger: ShareLedger,
    events: mpsc::Sender<PoolEvent>,
    subscribers: RwLock<HashMap<u64, SubscriberEntry>>,
    address_sessions: RwLock<HashMap<String, HashSet<u64>>>,
    next_session_id: AtomicU64,
}

impl StratumServer {
    pub fn new(config: StratumConfig, templates: Arc<TemplateManager>, events: mpsc::Sender<PoolEvent>) -> Arc<Self> {
        Arc::new(StratumServer {
            config,
            templates,
            ledger: ShareLedger::new(),
            events,
            subscribers: RwLock::new(HashMap::new()),
            address_sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub async fn run(self: Arc<Self>, mut announcements: mpsc::Receiver<Announcement>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("stratum listening on {}", self.config.bind_addr);

        let fanout_server = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(announcement) = announcements.recv().await {
                fanout_server.fan_out(announcement).await;
            }
        });

        loop {
            let (socket, addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(socket, addr).await {
                    debug!("connection {addr} closed: {err}");
                }
            });
        }
    }

    async fn fan_out(&self, announcement: Announcement) {
        let timestamp_le = announcement.timestamp.to_le_bytes();
        let payload_hex = format!("{}{}", hex::encode(announcement.pre_hash), hex::encode(timestamp_le));
        let job_id_hex = format!("{:04x}", announcement.job_id);

        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (&id, entry) in subscribers.iter() {
                let notification = Notification {
                    method: "mining.notify",
                    params: vec![Value::String(job_id_hex.clone()), Value::String(payload_hex.clone())],
                };
                if entry.sender.try_send(notification.to_line()).is_err() {
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, addr: SocketAddr) -> std::io::Result<()> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let extranonce = [((id >> 8) & 0xff) as u8, (id & 0xff) as u8];
        let now = kpool_util::now_secs();
        let mut session = Session::new(id, extranonce, self.config.starting_difficulty, now);

        let (read_half, mut write_half) = tokio::io::split(socket);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(256);

        let writer_addr = addr;
        tokio::spawn(async move {
            while let Some(line) = outgoing_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    debug!("write failed to {writer_addr}, dropping connection");
                    break;
                }
            }
        });

        let mut framed = FramedRead::new(read_half, LinesCodec::new_with_max_length(BUFFER_LIMIT_BYTES));
        let idle_deadline = Instant::now() + IDLE_TIMEOUT;
        let mut rate_window_start = now;
        let mut rate_window_count: u32 = 0;

        loop {
            let line = if !session.subscribed {
                match tokio::time::timeout_at(idle_deadline.into(), framed_next(&mut framed)).await {
                    Ok(inner) => inner,
                    Err(_) => {
                        info!("session {id} ({addr}) closed: idle-timeout-no-subscribe");
                        return Ok(());
                    }
                }
            } else {
                framed_next(&mut framed).await
            };

            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    info!("session {id} ({addr}) closed: buffer overflow");
                    break;
                }
                Some(Err(err)) => {
                    debug!("session {id} ({addr}) read error: {err}");
                    break;
                }
                None => break,
            };

            session.message_count += 1;
            let nowt = kpool_util::now_secs();
            if nowt.saturating_sub(rate_window_start) >= RATE_LIMIT_WINDOW_SECS {
                rate_window_start = nowt;
                rate_window_count = 0;
            }
            rate_window_count += 1;
            if rate_window_count > RATE_LIMIT_MAX_MESSAGES {
                info!("session {id} ({addr}) closed: rate-limit-exceeded");
                break;
            }

            if let Err(err) = self
                .process_line(&mut session, &line, &outgoing_tx)
                .await
            {
                debug!("session {id} ({addr}) fatal write error: {err}");
                break;
            }
        }

        self.subscribers.write().await.remove(&id);
        let mut address_sessions = self.address_sessions.write().await;
        for sessions in address_sessions.values_mut() {
            sessions.remove(&id);
        }
        address_sessions.retain(|_, sessions| !sessions.is_empty());
        Ok(())
    }

    async fn process_line(
        &self,
        session: &mut Session,
        line: &str,
        outgoing: &mpsc::Sender<String>,
    ) -> Result<(), mpsc::error::SendError<String>> {
        let request: Request = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(err) => {
                warn!("malformed request: {err}");
                let response = Response::err(Value::Null, &StratumError::Unknown(err.to_string()));
                return outgoing.send(response.to_line()).await.map_err(|e| mpsc::error::SendError(e.0));
            }
        };

        if session.state == SessionState::Connected && request.method != "mining.subscribe" {
            let response = Response::err(request.id, &StratumError::NotSubscribed);
            return outgoing.send(response.to_line()).await.map_err(|e| mpsc::error::SendError(e.0));
        }

        match request.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(session, request, outgoing).await,
            "mining.authorize" => self.handle_authorize(session, request, outgoing).await,
            "mining.submit" => self.handle_submit(session, request, outgoing).await,
            other => {
                warn!("unhandled method {other}");
                let response = Response::err(request.id, &StratumError::Unknown(format!("unknown method {other}")));
                outgoing.send(response.to_line()).await.map_err(|e| mpsc::error::SendError(e.0))
            }
        }
    }

    async fn handle_subscribe(
        &self,
        session: &mut Session,
        request: Request,
        outgoing: &mpsc::Sender<String>,
    ) -> Result<(), mpsc::error::SendError<String>> {
        let agent = request.params.first().and_then(|v| v.as_str()).unwrap_or("").to_string();
        session.user_agent = agent.clone();
        session.dialect = dialect::detect(&agent);
        session.state = SessionState::Subscribed;
        session.subscribed = true;

        let result = match session.dialect {
            Dialect::Standard => Value::Array(vec![Value::Bool(true), Value::String("EthereumStratum/1.0.0".into())]),
            Dialect::Bitmain => {
                let extranonce_hex = session.extranonce_hex();
                let remaining = 8 - (extranonce_hex.len() / 2) as i64;
                Value::Array(vec![Value::Null, Value::String(extranonce_hex), Value::from(remaining)])
            }
        };
        let response = Response::ok(request.id, result);
        outgoing.send(response.to_line()).await.map_err(|e| mpsc::error::SendError(e.0))?;

        let set_extranonce = match session.dialect {
            Dialect::Standard => Notification {
                method: "set_extranonce",
                params: vec![Value::String(session.extranonce_hex())],
            },
            Dialect::Bitmain => {
                let extranonce_hex = session.extranonce_hex();
                let remaining = 8 - (extranonce_hex.len() / 2) as i64;
                Notification {
                    method: "set_extranonce",
                    params: vec![Value::String(extranonce_hex), Value::from(remaining)],
                }
            }
        };
        outgoing.send(set_extranonce.to_line()).await.map_err(|e| mpsc::error::SendError(e.0))?;

        let set_difficulty = Notification {
            method: "mining.set_difficulty",
            params: vec![Value::from(session.difficulty.to_f64())],
        };
        outgoing.send(set_difficulty.to_line()).await.map_err(|e| mpsc::error::SendError(e.0))?;

        if let Some(config) = &self.config.vardiff {
            session.vardiff = Some(crate::vardiff::VardiffState::new(session.difficulty, kpool_util::now_secs()));
            let _ = config;
        }

        self.subscribers.write().await.insert(
            session.id,
            SubscriberEntry {
                sender: outgoing.clone(),
                dialect: session.dialect,
            },
        );

        Ok(())
    }

    async fn handle_authorize(
        &self,
        session: &mut Session,
        request: Request,
        outgoing: &mpsc::Sender<String>,
    ) -> Result<(), mpsc::error::SendError<String>> {
        let identity = request.params.first().and_then(|v| v.as_str()).unwrap_or("");
        let response = match self.authorize_identity(session, identity).await {
            Ok(()) => {
                session.state = SessionState::Authorized;
                Response::ok(request.id, Value::Bool(true))
            }
            Err(err) => Response::err(request.id, &err),
        };
        outgoing.send(response.to_line()).await.map_err(|e| mpsc::error::SendError(e.0))
    }

    async fn authorize_identity(&self, session: &mut Session, identity: &str) -> Result<(), StratumError> {
        let (addr, worker) = kpool_util::split_identity(identity)
            .ok_or_else(|| StratumError::Unknown("missing worker name".into()))?;
        if worker.is_empty() {
            return Err(StratumError::Unknown("missing worker name".into()));
        }
        let canonical = kpool_util::canonicalize(addr).map_err(|e| StratumError::Unknown(e.to_string()))?;

        session.workers.insert((canonical.clone(), worker.to_string()));
        self.address_sessions
            .write()
            .await
            .entry(canonical)
            .or_default()
            .insert(session.id);
        Ok(())
    }

    async fn handle_submit(
        &self,
        session: &mut Session,
        request: Request,
        outgoing: &mpsc::Sender<String>,
    ) -> Result<(), mpsc::error::SendError<String>> {
        let result = self.validate_and_apply_share(session, &request.params).await;
        let response = match &result {
            Ok(()) => Response::ok(request.id, Value::Bool(true)),
            Err(err) => Response::err(request.id, err),
        };
        outgoing.send(response.to_line()).await.map_err(|e| mpsc::error::SendError(e.0))?;

        // Vardiff only tracks accepted shares (spec §4.C.5 "On each accepted
        // share"); a rejected submit must not touch `last_share_at`/
        // `share_count` or it corrupts the controller's timing.
        if result.is_ok() {
            if let Some(difficulty) = session.vardiff.as_mut().and_then(|v| {
                self.config
                    .vardiff
                    .as_ref()
                    .and_then(|cfg| v.on_share(cfg, kpool_util::now_secs()))
            }) {
                session.difficulty = difficulty;
                let notification = Notification {
                    method: "mining.set_difficulty",
                    params: vec![Value::from(difficulty.to_f64())],
                };
                outgoing.send(notification.to_line()).await.map_err(|e| mpsc::error::SendError(e.0))?;
            }
        }

        Ok(())
    }

    async fn validate_and_apply_share(&self, session: &mut Session, params: &[Value]) -> Result<(), StratumError> {
        let identity = params
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| StratumError::Unknown("missing worker identity".into()))?;
        let (addr, worker) = kpool_util::split_identity(identity)
            .ok_or_else(|| StratumError::Unknown("missing worker name".into()))?;
        let canonical = kpool_util::canonicalize(addr).map_err(|e| StratumError::Unknown(e.to_string()))?;
        let worker_id: WorkerId = (canonical.clone(), worker.to_string());
        if !session.is_authorized_worker(&worker_id) {
            return Err(StratumError::UnauthorizedWorker);
        }

        let job_id_str = params.get(1).and_then(|v| v.as_str()).unwrap_or("");
        let job_id = u16::from_str_radix(job_id_str, 16).map_err(|_| StratumError::JobNotFound)?;
        let pre_hash = self.templates.get_hash(job_id).await.ok_or(StratumError::JobNotFound)?;
        let verifier = self.templates.get_verifier(&pre_hash).await.ok_or(StratumError::JobNotFound)?;

        let nonce_str = params.get(2).and_then(|v| v.as_str()).unwrap_or("");
        let nonce = parse_nonce(session, nonce_str)?;

        if self.ledger.seen_or_record(nonce).await {
            return Err(StratumError::DuplicateShare);
        }

        let (is_block, target_hit) = verifier.check_work(nonce);
        let implied = session.difficulty.implied_target(&Target::max());
        if target_hit > implied {
            return Err(StratumError::LowDifficultyShare);
        }

        if is_block {
            let finder = Contribution {
                address: canonical.clone(),
                difficulty: session.difficulty,
            };
            match self.templates.submit(&pre_hash, nonce).await {
                Ok(canonical_hash) => {
                    // Only the snapshotted *other* contributions travel here;
                    // the finder's own contribution is appended once, by the
                    // Pool orchestrator (spec §4.E.1 step 1), not here, or it
                    // would be double-counted in the block's reward split.
                    let contributions = self.ledger.drain().await;
                    let _ = self
                        .events
                        .send(PoolEvent::BlockFound {
                            hash: canonical_hash,
                            finder,
                            contributions,
                        })
                        .await;
                    session.enter_working();
                    Ok(())
                }
                Err(err) => {
                    self.ledger.record_contribution(canonical, session.difficulty).await;
                    session.enter_working();
                    Err(StratumError::Unknown(format!("block-submission-failed: {err}")))
                }
            }
        } else {
            self.ledger.record_contribution(canonical, session.difficulty).await;
            session.enter_working();
            Ok(())
        }
    }
}

fn parse_nonce(session: &Session, raw: &str) -> Result<u64, StratumError> {
    match session.dialect {
        Dialect::Bitmain => raw
            .parse::<u64>()
            .map_err(|_| StratumError::Unknown("invalid decimal nonce".into())),
        Dialect::Standard => {
            let padded = if raw.len() < 16 {
                format!("{}{}", session.extranonce_hex(), raw)
            } else {
                raw.to_string()
            };
            let bytes = hex::decode(&padded).map_err(|_| StratumError::Unknown("invalid hex nonce".into()))?;
            if bytes.len() != 8 {
                return Err(StratumError::Unknown("nonce must be 8 bytes".into()));
            }
            let mut array = [0u8; 8];
            array.copy_from_slice(&bytes);
            Ok(u64::from_be_bytes(array))
        }
    }
}

async fn framed_next(
    framed: &mut FramedRead<tokio::io::ReadHalf<TcpStream>, LinesCodec>,
) -> Option<Result<String, LinesCodecError>> {
    use futures::StreamExt;
    framed.next().await
}

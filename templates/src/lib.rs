//! Bounded window of admitted block templates, keyed by pre-PoW hash, with
//! short job-ID minting and the submission bridge back to the node (spec
//! §4.B "TemplateManager"). The window owns nothing the Stratum layer needs
//! to mutate directly; it is read through `getHash`/`getPoW` and written
//! only by template admission and FIFO eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use kpool_node::{BlockTemplate, Hash, NodeClient, NodeError, PowVerifier};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;

/// Default size of the template window (spec §4.B, "default 40").
pub const DEFAULT_WINDOW: usize = 40;

/// Delay before re-querying the node for the canonical block hash after a
/// successful submission (spec §4.B step on `submit`).
const SUBMIT_CONFIRM_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("job not found")]
    JobNotFound,
    #[error("block submission failed: {0}")]
    BlockSubmissionFailed(String),
}

impl From<NodeError> for TemplateError {
    fn from(err: NodeError) -> Self {
        TemplateError::BlockSubmissionFailed(err.to_string())
    }
}

/// Emitted once per admitted template; the Stratum layer turns this directly
/// into a `mining.notify` frame.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub job_id: u16,
    pub pre_hash: Hash,
    pub timestamp: u64,
}

struct Entry {
    job_id: u16,
    verifier: Arc<dyn PowVerifier>,
    finalized_template: BlockTemplate,
}

struct Window {
    order: VecDeque<Hash>,
    entries: HashMap<Hash, Entry>,
    jobs: HashMap<u16, Hash>,
    next_job_id: u16,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Window {
            order: VecDeque::new(),
            entries: HashMap::new(),
            jobs: HashMap::new(),
            next_job_id: 0,
            capacity,
        }
    }

    fn mint_job_id(&mut self) -> u16 {
        let id = self.next_job_id;
        self.next_job_id = self.next_job_id.wrapping_add(1);
        id
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&oldest) {
                self.jobs.remove(&entry.job_id);
            }
        }
    }
}

/// Owns the template window and job map; never shared mutably outside this
/// crate (spec §3 "Ownership").
pub struct TemplateManager {
    node: Arc<dyn NodeClient>,
    window: RwLock<Window>,
}

impl TemplateManager {
    pub fn new(node: Arc<dyn NodeClient>, capacity: usize) -> Self {
        TemplateManager {
            node,
            window: RwLock::new(Window::new(capacity)),
        }
    }

    /// Subscribes to the node's new-template stream and fetches one template
    /// immediately so at least one job exists before any miner connects.
    /// Returns a channel the caller drains for `mining.notify` fan-out.
    pub async fn register(self: &Arc<Self>) -> Result<mpsc::Receiver<Announcement>, TemplateError> {
        let (tx, rx) = mpsc::channel(64);

        let initial = self.node.get_block_template("").await?;
        if let Some(announcement) = self.admit(initial).await {
            let _ = tx.send(announcement).await;
        }

        let mut stream = self.node.subscribe_new_block_template().await?;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(template) = stream.recv().await {
                if let Some(announcement) = manager.admit(template).await {
                    if tx.send(announcement).await.is_err() {
                        break;
                    }
                }
            }
            warn!("template stream ended");
        });

        Ok(rx)
    }

    /// Admits a freshly announced template, evicting the oldest entry if the
    /// window is full. Returns `None` if this pre-PoW hash was already
    /// admitted (spec §4.B "skip if already present").
    async fn admit(&self, template: BlockTemplate) -> Option<Announcement> {
        let mut window = self.window.write().await;
        if window.entries.contains_key(&template.pre_pow_hash) {
            debug!("template {} already admitted, skipping", hex::encode(template.pre_pow_hash));
            return None;
        }

        let verifier: Arc<dyn PowVerifier> = Arc::from(self.node.make_verifier(&template));
        let job_id = window.mint_job_id();
        let pre_hash = template.pre_pow_hash;
        let timestamp = template.timestamp;

        window.entries.insert(
            pre_hash,
            Entry {
                job_id,
                verifier,
                finalized_template: template,
            },
        );
        window.jobs.insert(job_id, pre_hash);
        window.order.push_back(pre_hash);

        if window.order.len() > window.capacity {
            window.evict_oldest();
        }

        info!("admitted template job={job_id} pre_hash={}", hex::encode(pre_hash));
        Some(Announcement {
            job_id,
            pre_hash,
            timestamp,
        })
    }

    pub async fn get_hash(&self, job_id: u16) -> Option<Hash> {
        self.window.read().await.jobs.get(&job_id).copied()
    }

    pub async fn get_verifier(&self, pre_hash: &Hash) -> Option<Arc<dyn PowVerifier>> {
        self.window
            .read()
            .await
            .entries
            .get(pre_hash)
            .map(|entry| Arc::clone(&entry.verifier))
    }

    /// Finalizes `nonce` into the stored template and submits it to the
    /// node. On success, waits briefly and asks the node for the canonical
    /// block hash it recorded, falling back to a locally derived hash if
    /// that query fails.
    pub async fn submit(&self, pre_hash: &Hash, nonce: u64) -> Result<Hash, TemplateError> {
        let (verifier, local_template_hash) = {
            let window = self.window.read().await;
            let entry = window.entries.get(pre_hash).ok_or(TemplateError::JobNotFound)?;
            (Arc::clone(&entry.verifier), entry.finalized_template.pre_pow_hash)
        };

        let payload = verifier.finalize(nonce);
        self.node.submit_block(payload).await?;

        sleep(SUBMIT_CONFIRM_DELAY).await;

        match self.node.get_block(&local_template_hash).await {
            Ok(Some(info)) => Ok(info.hash),
            Ok(None) => {
                warn!("node has no record of submitted block yet, using locally finalized hash");
                Ok(local_template_hash)
            }
            Err(err) => {
                warn!("get_block query after submission failed, using locally finalized hash: {err}");
                Ok(local_template_hash)
            }
        }
    }

    pub async fn window_len(&self) -> usize {
        self.window.read().await.order.len()
    }
}

//! JSON-file backed [`Store`], one file per sub-domain (`miners.json`,
//! `blocks.json`, `payments.json`). Each sub-domain lives behind its own
//! `tokio::sync::RwLock<HashMap<...>>` in-memory cache, loaded once at
//! construction and rewritten whole after every mutating call — simple and
//! easy to inspect by hand, at the cost of an O(n) rewrite per write, which
//! is acceptable at this pool's scale.

use std::collections::HashMap;
use std::path::PathBuf;

use log::info;
use tokio::sync::RwLock;

use crate::{BlockRecord, MinerRecord, PaymentRecord, PaymentUpdate, Store, StoreError};
use kpool_util::POOL_REVENUE_KEY;

pub struct JsonStore {
    base_dir: PathBuf,
    miners: RwLock<HashMap<String, MinerRecord>>,
    blocks: RwLock<HashMap<String, BlockRecord>>,
    payments: RwLock<HashMap<String, PaymentRecord>>,
}

impl JsonStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&base_dir).await?;

        let store = JsonStore {
            base_dir,
            miners: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
            payments: RwLock::new(HashMap::new()),
        };
        store.load_data().await?;
        Ok(store)
    }

    fn miners_path(&self) -> PathBuf {
        self.base_dir.join("miners.json")
    }

    fn blocks_path(&self) -> PathBuf {
        self.base_dir.join("blocks.json")
    }

    fn payments_path(&self) -> PathBuf {
        self.base_dir.join("payments.json")
    }

    async fn load_data(&self) -> Result<(), StoreError> {
        if let Some(loaded) = read_json(&self.miners_path()).await? {
            *self.miners.write().await = loaded;
        }
        if let Some(loaded) = read_json(&self.blocks_path()).await? {
            *self.blocks.write().await = loaded;
        }
        if let Some(loaded) = read_json(&self.payments_path()).await? {
            *self.payments.write().await = loaded;
        }
        info!("loaded store data from {}", self.base_dir.display());
        Ok(())
    }

    async fn save_miners(&self) -> Result<(), StoreError> {
        write_json(&self.miners_path(), &*self.miners.read().await).await
    }

    async fn save_blocks(&self) -> Result<(), StoreError> {
        write_json(&self.blocks_path(), &*self.blocks.read().await).await
    }

    async fn save_payments(&self) -> Result<(), StoreError> {
        write_json(&self.payments_path(), &*self.payments.read().await).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = tokio::fs::read(path).await?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

async fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl Store for JsonStore {
    async fn get_miner(&self, address: &str) -> Result<MinerRecord, StoreError> {
        Ok(self.miners.read().await.get(address).cloned().unwrap_or_default())
    }

    async fn add_balance(&self, address: &str, delta: i64) -> Result<u64, StoreError> {
        let mut miners = self.miners.write().await;
        let record = miners.entry(address.to_string()).or_default();
        let current = record.pending_balance;
        let updated = if delta < 0 {
            let magnitude = delta.unsigned_abs();
            current.checked_sub(magnitude).ok_or(StoreError::NegativeBalance { current, delta })?
        } else {
            current + delta as u64
        };
        record.pending_balance = updated;
        drop(miners);
        self.save_miners().await?;
        Ok(updated)
    }

    async fn set_payment_interval(&self, address: &str, hours: Option<u64>) -> Result<(), StoreError> {
        let mut miners = self.miners.write().await;
        miners.entry(address.to_string()).or_default().payment_interval_hours = hours;
        drop(miners);
        self.save_miners().await
    }

    async fn set_payment_threshold(&self, address: &str, threshold: Option<u64>) -> Result<(), StoreError> {
        let mut miners = self.miners.write().await;
        miners.entry(address.to_string()).or_default().payment_threshold = threshold;
        drop(miners);
        self.save_miners().await
    }

    async fn set_last_payout_time(&self, address: &str, timestamp: u64) -> Result<(), StoreError> {
        let mut miners = self.miners.write().await;
        miners.entry(address.to_string()).or_default().last_payout_time = timestamp;
        drop(miners);
        self.save_miners().await
    }

    async fn increment_block_count(&self, address: &str) -> Result<(), StoreError> {
        let mut miners = self.miners.write().await;
        miners.entry(address.to_string()).or_default().blocks_found += 1;
        drop(miners);
        self.save_miners().await
    }

    async fn add_block(&self, record: BlockRecord) -> Result<(), StoreError> {
        let mut blocks = self.blocks.write().await;
        match blocks.get_mut(&record.hash) {
            Some(existing) => {
                existing.paid = record.paid;
                existing.contributions = record.contributions;
            }
            None => {
                blocks.insert(record.hash.clone(), record);
            }
        }
        drop(blocks);
        self.save_blocks().await
    }

    async fn mark_block_paid(&self, hash: &str) -> Result<(), StoreError> {
        let mut blocks = self.blocks.write().await;
        let record = blocks
            .get_mut(hash)
            .ok_or_else(|| StoreError::NotFound(format!("block {hash}")))?;
        record.paid = true;
        drop(blocks);
        self.save_blocks().await
    }

    async fn get_blocks(&self, limit: usize) -> Result<Vec<BlockRecord>, StoreError> {
        let blocks = self.blocks.read().await;
        let mut all: Vec<BlockRecord> = blocks.values().cloned().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(limit);
        Ok(all)
    }

    async fn get_blocks_by_address(&self, address: &str, limit: usize) -> Result<Vec<BlockRecord>, StoreError> {
        let blocks = self.blocks.read().await;
        let mut matching: Vec<BlockRecord> = blocks
            .values()
            .filter(|b| b.finder == address)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn get_unpaid_blocks(&self) -> Result<Vec<BlockRecord>, StoreError> {
        let blocks = self.blocks.read().await;
        let mut unpaid: Vec<BlockRecord> = blocks.values().filter(|b| !b.paid).cloned().collect();
        unpaid.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(unpaid)
    }

    async fn add_payment(&self, record: PaymentRecord) -> Result<(), StoreError> {
        let mut payments = self.payments.write().await;
        payments.insert(record.tx_id.clone(), record);
        drop(payments);
        self.save_payments().await
    }

    async fn update_payment(&self, tx_id: &str, update: PaymentUpdate) -> Result<(), StoreError> {
        let mut payments = self.payments.write().await;
        let record = payments
            .get_mut(tx_id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {tx_id}")))?;
        record.status = update.status;
        if let Some(new_id) = update.tx_id {
            let mut record = record.clone();
            record.tx_id = new_id.clone();
            payments.remove(tx_id);
            payments.insert(new_id, record);
        }
        drop(payments);
        self.save_payments().await
    }

    async fn get_all_miners(&self) -> Result<Vec<(String, MinerRecord)>, StoreError> {
        let miners = self.miners.read().await;
        Ok(miners
            .iter()
            .filter(|(address, _)| address.as_str() != POOL_REVENUE_KEY)
            .map(|(address, record)| (address.clone(), record.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Contribution;
    use kpool_util::Difficulty;
    use rust_decimal::Decimal;

    fn make_store() -> (tempfile::TempDir, ()) {
        let dir = tempfile::tempdir().unwrap();
        (dir, ())
    }

    #[tokio::test]
    async fn balance_round_trips_and_rejects_overdraft() {
        let (dir, _) = make_store();
        let store = JsonStore::new(dir.path().to_path_buf()).await.unwrap();

        assert_eq!(store.add_balance("miner1", 1000).await.unwrap(), 1000);
        assert_eq!(store.add_balance("miner1", -400).await.unwrap(), 600);
        assert!(store.add_balance("miner1", -10_000).await.is_err());

        let record = store.get_miner("miner1").await.unwrap();
        assert_eq!(record.pending_balance, 600);
    }

    #[tokio::test]
    async fn add_block_is_idempotent_on_hash() {
        let (dir, _) = make_store();
        let store = JsonStore::new(dir.path().to_path_buf()).await.unwrap();

        let block = BlockRecord {
            hash: "abc".into(),
            finder: "miner1".into(),
            timestamp: 100,
            finder_difficulty: Difficulty::new(Decimal::from(1000)),
            daa_score: 1,
            paid: false,
            contributions: vec![],
        };
        store.add_block(block.clone()).await.unwrap();

        let mut updated = block.clone();
        updated.paid = true;
        updated.contributions = vec![Contribution {
            address: "miner1".into(),
            difficulty: Difficulty::new(Decimal::from(1000)),
        }];
        store.add_block(updated).await.unwrap();

        let blocks = store.get_blocks(10).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].paid);
        assert_eq!(blocks[0].contributions.len(), 1);
    }

    #[tokio::test]
    async fn get_all_miners_excludes_pool_revenue_key() {
        let (dir, _) = make_store();
        let store = JsonStore::new(dir.path().to_path_buf()).await.unwrap();

        store.add_balance("miner1", 10).await.unwrap();
        store.add_balance(POOL_REVENUE_KEY, 10).await.unwrap();

        let miners = store.get_all_miners().await.unwrap();
        assert_eq!(miners.len(), 1);
        assert_eq!(miners[0].0, "miner1");
    }

    #[tokio::test]
    async fn balance_above_2_53_round_trips_and_is_persisted_as_a_json_string() {
        let (dir, _) = make_store();
        let store = JsonStore::new(dir.path().to_path_buf()).await.unwrap();

        let above_2_53 = (1u64 << 53) + 42;
        store.add_balance("miner1", above_2_53 as i64).await.unwrap();

        let on_disk = tokio::fs::read_to_string(dir.path().join("miners.json")).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(
            parsed["miner1"]["pending_balance"],
            serde_json::Value::String(above_2_53.to_string()),
            "spec §6 requires integers exceeding 53 bits to serialize as strings"
        );

        let record = store.get_miner("miner1").await.unwrap();
        assert_eq!(record.pending_balance, above_2_53);
    }

    #[tokio::test]
    async fn data_survives_reload() {
        let (dir, _) = make_store();
        {
            let store = JsonStore::new(dir.path().to_path_buf()).await.unwrap();
            store.add_balance("miner1", 500).await.unwrap();
        }
        let reloaded = JsonStore::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reloaded.get_miner("miner1").await.unwrap().pending_balance, 500);
    }
}

//! The block-recording and reward-distribution core of the orchestrator
//! (spec §4.E.1 and §4.E.4), plus the force-payout path (§4.E.5).

use kpool_node::Hash;
use kpool_store::{BlockRecord, Contribution, PaymentRecord, PaymentStatus, PaymentUpdate};
use kpool_stratum::PoolEvent;
use kpool_treasury::TreasuryEvent;
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::reward::{fold_unpaid_work, floor_share, BlockWork};
use crate::{Pool, PoolError};

impl Pool {
    pub(crate) async fn run_event_loop(
        self: std::sync::Arc<Self>,
        mut stratum_events: mpsc::Receiver<PoolEvent>,
        mut treasury_events: mpsc::Receiver<TreasuryEvent>,
    ) {
        loop {
            tokio::select! {
                event = stratum_events.recv() => match event {
                    Some(event) => self.handle_pool_event(event).await,
                    None => {
                        warn!("stratum event channel closed, pool event loop exiting");
                        break;
                    }
                },
                event = treasury_events.recv() => match event {
                    Some(event) => self.handle_treasury_event(event).await,
                    None => {
                        warn!("treasury event channel closed, pool event loop exiting");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::BlockFound { hash, finder, contributions } => {
                self.record_block(hash, finder, contributions).await;
            }
        }
    }

    async fn handle_treasury_event(&self, event: TreasuryEvent) {
        match event {
            TreasuryEvent::Coinbase { net_amount, .. } => {
                if let Err(err) = self.distribute_matured(net_amount).await {
                    error!("reward distribution failed: {err}");
                }
            }
            TreasuryEvent::Revenue { pool_fee } => {
                if pool_fee == 0 {
                    return;
                }
                if let Err(err) = self.store.add_balance(kpool_util::POOL_REVENUE_KEY, pool_fee as i64).await {
                    error!("failed to credit pool revenue: {err}");
                }
            }
        }
    }

    /// Spec §4.E.1: verify the block is actually in the chain before
    /// persisting it, but never lose payout data to a transient RPC error.
    async fn record_block(&self, hash: Hash, finder: Contribution, contributions: Vec<Contribution>) {
        let mut all_contributions = contributions;
        all_contributions.push(finder.clone());
        let work = BlockWork::from_contributions(&all_contributions, 0);

        match self.node.get_block(&hash).await {
            Ok(Some(info)) => {
                let hash_hex = hex::encode(info.hash);
                let record = BlockRecord {
                    hash: hash_hex.clone(),
                    finder: finder.address.clone(),
                    timestamp: kpool_util::now_secs(),
                    finder_difficulty: finder.difficulty,
                    daa_score: info.daa_score,
                    paid: false,
                    contributions: all_contributions,
                };
                if let Err(err) = self.store.add_block(record).await {
                    error!("failed to persist block {hash_hex}: {err}");
                    return;
                }
                if let Err(err) = self.store.increment_block_count(&finder.address).await {
                    error!("failed to bump block count for {}: {err}", finder.address);
                }
                let mut state = self.reward_state.write().await;
                let mut work = work;
                work.daa_score = info.daa_score;
                state.insert(hash_hex.clone(), work);
                info!("recorded block {hash_hex} found by {}", finder.address);
            }
            Ok(None) => {
                warn!("block {} not found by node, treating as orphan/rejected", hex::encode(hash));
            }
            Err(err) => {
                let hash_hex = hex::encode(hash);
                warn!("transient error verifying block {hash_hex}, persisting anyway: {err}");
                let record = BlockRecord {
                    hash: hash_hex.clone(),
                    finder: finder.address.clone(),
                    timestamp: kpool_util::now_secs(),
                    finder_difficulty: finder.difficulty,
                    daa_score: 0,
                    paid: false,
                    contributions: work.contributors.iter().map(|(address, difficulty)| Contribution {
                        address: address.clone(),
                        difficulty: kpool_util::Difficulty::new(*difficulty),
                    }).collect(),
                };
                if let Err(err) = self.store.add_block(record).await {
                    error!("failed to persist block {hash_hex} after transient error: {err}");
                    return;
                }
                let _ = self.store.increment_block_count(&finder.address).await;
                self.reward_state.write().await.insert(hash_hex, work);
            }
        }
    }

    /// Spec §4.E.4: fold the unpaid-block window, credit every
    /// contributor's balance, mark the folded blocks paid, then decide and
    /// send payouts for whichever addresses crossed a threshold or
    /// interval. Serialized by `distribution_lock` so at most one
    /// computation runs at a time (spec §5).
    pub(crate) async fn distribute_matured(&self, net_amount: u64) -> Result<(), PoolError> {
        let _guard = self.distribution_lock.lock().await;
        self.restore_if_empty().await?;

        let (contributors, accumulated, consumed) = {
            let state = self.reward_state.read().await;
            fold_unpaid_work(self.node.as_ref(), &state).await
        };

        if consumed.is_empty() || accumulated.is_zero() {
            warn!("distribute_matured called with no unpaid work to fold (amount {net_amount})");
            return Ok(());
        }

        let now = kpool_util::now_secs();
        let mut outputs = Vec::new();
        let mut interval_addresses = Vec::new();

        for (address, work) in &contributors {
            let share = floor_share(*work, accumulated, net_amount);
            if share == 0 {
                continue;
            }
            let record = self.store.get_miner(address).await?;
            let updated = self.store.add_balance(address, share as i64).await?;

            let threshold = record.payment_threshold.unwrap_or(self.config.default_payment_threshold);
            let interval_due = record
                .payment_interval_hours
                .map(|hours| now.saturating_sub(record.last_payout_time) >= hours * 3600)
                .unwrap_or(false);

            if updated > threshold || (interval_due && updated > 0) {
                self.store.add_balance(address, -(updated as i64)).await?;
                outputs.push(kpool_node::PaymentOutput { address: address.clone(), amount: updated });
                if record.payment_interval_hours.is_some() {
                    interval_addresses.push(address.clone());
                }
            }
        }

        // The credit step above is durable regardless of whether any
        // output crossed a threshold this round; mark the folded blocks
        // paid now so a later distribute_matured call never re-folds them.
        for hash in &consumed {
            self.store.mark_block_paid(hash).await?;
        }
        self.reward_state.write().await.remove_all(&consumed);

        if outputs.is_empty() {
            return Ok(());
        }

        self.send_and_record(outputs, interval_addresses, consumed, now).await
    }

    async fn send_and_record(
        &self,
        outputs: Vec<kpool_node::PaymentOutput>,
        interval_addresses: Vec<String>,
        block_hashes: Vec<String>,
        now: u64,
    ) -> Result<(), PoolError> {
        match self.treasury.send(&outputs).await {
            Ok(tx_ids) => {
                for (output, tx_id) in outputs.iter().zip(tx_ids.iter()) {
                    self.store
                        .add_payment(PaymentRecord {
                            tx_id: hex::encode(tx_id),
                            address: output.address.clone(),
                            amount: output.amount,
                            status: PaymentStatus::Sent,
                            block_hashes: block_hashes.clone(),
                            balance_before: output.amount,
                            timestamp: now,
                        })
                        .await?;
                }
                for address in &interval_addresses {
                    self.store.set_last_payout_time(address, now).await?;
                }
                Ok(())
            }
            Err(err) => {
                for output in &outputs {
                    self.store.add_balance(&output.address, output.amount as i64).await?;
                    let tx_id = format!("failed-{}-{now}", output.address);
                    self.store
                        .add_payment(PaymentRecord {
                            tx_id: tx_id.clone(),
                            address: output.address.clone(),
                            amount: output.amount,
                            status: PaymentStatus::Failed,
                            block_hashes: block_hashes.clone(),
                            balance_before: 0,
                            timestamp: now,
                        })
                        .await?;
                    self.store
                        .update_payment(&tx_id, PaymentUpdate { status: PaymentStatus::Restored, tx_id: None })
                        .await?;
                }
                Err(PoolError::Treasury(err))
            }
        }
    }

    /// Spec §4.E.5: identical to the normal path but ignores threshold and
    /// interval gates.
    pub(crate) async fn force_payout_single(&self, address: &str) -> Result<Hash, PoolError> {
        let record = self.store.get_miner(address).await?;
        if record.pending_balance == 0 {
            return Err(PoolError::NothingToPay);
        }
        let now = kpool_util::now_secs();
        self.store.add_balance(address, -(record.pending_balance as i64)).await?;
        let output = kpool_node::PaymentOutput { address: address.to_string(), amount: record.pending_balance };

        match self.treasury.send(std::slice::from_ref(&output)).await {
            Ok(tx_ids) => {
                let tx_id = tx_ids[0];
                self.store
                    .add_payment(PaymentRecord {
                        tx_id: hex::encode(tx_id),
                        address: output.address.clone(),
                        amount: output.amount,
                        status: PaymentStatus::Sent,
                        block_hashes: vec![],
                        balance_before: output.amount,
                        timestamp: now,
                    })
                    .await?;
                Ok(tx_id)
            }
            Err(err) => {
                self.store.add_balance(address, output.amount as i64).await?;
                let tx_id = format!("failed-force-{address}-{now}");
                self.store
                    .add_payment(PaymentRecord {
                        tx_id: tx_id.clone(),
                        address: output.address.clone(),
                        amount: output.amount,
                        status: PaymentStatus::Failed,
                        block_hashes: vec![],
                        balance_before: 0,
                        timestamp: now,
                    })
                    .await?;
                self.store
                    .update_payment(&tx_id, PaymentUpdate { status: PaymentStatus::Restored, tx_id: None })
                    .await?;
                Err(PoolError::Treasury(err))
            }
        }
    }

    /// The force-all path additionally refuses to submit a partial set if
    /// the treasury cannot cover every payable balance (spec §4.E.5).
    pub(crate) async fn force_payout_everyone(&self) -> Result<Vec<Hash>, PoolError> {
        let miners = self.store.get_all_miners().await?;
        let payable: Vec<(String, u64)> = miners
            .into_iter()
            .filter(|(_, record)| record.pending_balance > 0)
            .map(|(address, record)| (address, record.pending_balance))
            .collect();
        if payable.is_empty() {
            return Ok(Vec::new());
        }

        let required: u64 = payable.iter().map(|(_, balance)| balance).sum();
        let available = self.treasury.balance().await?;
        if available < required {
            return Err(PoolError::TreasuryShortfall { required, available });
        }

        let now = kpool_util::now_secs();
        let mut outputs = Vec::with_capacity(payable.len());
        for (address, balance) in &payable {
            self.store.add_balance(address, -(*balance as i64)).await?;
            outputs.push(kpool_node::PaymentOutput { address: address.clone(), amount: *balance });
        }

        match self.treasury.send(&outputs).await {
            Ok(tx_ids) => {
                for (output, tx_id) in outputs.iter().zip(tx_ids.iter()) {
                    self.store
                        .add_payment(PaymentRecord {
                            tx_id: hex::encode(tx_id),
                            address: output.address.clone(),
                            amount: output.amount,
                            status: PaymentStatus::Sent,
                            block_hashes: vec![],
                            balance_before: output.amount,
                            timestamp: now,
                        })
                        .await?;
                }
                Ok(tx_ids)
            }
            Err(err) => {
                for output in &outputs {
                    self.store.add_balance(&output.address, output.amount as i64).await?;
                    let tx_id = format!("failed-force-all-{}-{now}", output.address);
                    self.store
                        .add_payment(PaymentRecord {
                            tx_id: tx_id.clone(),
                            address: output.address.clone(),
                            amount: output.amount,
                            status: PaymentStatus::Failed,
                            block_hashes: vec![],
                            balance_before: 0,
                            timestamp: now,
                        })
                        .await?;
                    self.store
                        .update_payment(&tx_id, PaymentUpdate { status: PaymentStatus::Restored, tx_id: None })
                        .await?;
                }
                Err(PoolError::Treasury(err))
            }
        }
    }
}

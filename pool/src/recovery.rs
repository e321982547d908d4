//! Restart recovery and the startup mature-block sweep (spec §4.E.2-3).

use std::sync::Arc;
use std::time::Duration;

use kpool_store::BlockRecord;
use log::{debug, error, info, warn};

use crate::reward::{decode_hash, BlockWork};
use crate::{Pool, PoolError, FORWARDED_UTXO_DAA_WINDOW, MATURE_SWEEP_AGE_SECS, MATURE_SWEEP_STARTUP_DELAY_SECS};

impl Pool {
    /// Reinstates unpaid blocks' aggregated work into memory, but only if
    /// the in-memory state is currently empty — calling this more than
    /// once (e.g. defensively before every distribution) must never
    /// double-credit a block that is already tracked (spec §9).
    pub(crate) async fn restore_if_empty(&self) -> Result<(), PoolError> {
        if !self.reward_state.read().await.is_empty() {
            return Ok(());
        }

        let unpaid = self.store.get_unpaid_blocks().await?;
        if unpaid.is_empty() {
            return Ok(());
        }

        let mut state = self.reward_state.write().await;
        if !state.is_empty() {
            // another task won the race while we were reading from the store
            return Ok(());
        }
        for block in &unpaid {
            let work = BlockWork::from_contributions(&block.contributions, block.daa_score);
            state.insert(block.hash.clone(), work);
        }
        info!("restart recovery reinstated {} unpaid block(s)", unpaid.len());
        Ok(())
    }

    /// Spawns the one-shot sweep described in spec §4.E.2: blocks that were
    /// already old when the pool came back up may have matured while the
    /// pool was down, so their maturity event was never observed.
    pub(crate) fn spawn_mature_block_sweep(self: Arc<Self>) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(MATURE_SWEEP_STARTUP_DELAY_SECS)).await;
            if let Err(err) = self.run_mature_block_sweep().await {
                error!("mature-block sweep failed: {err}");
            }
        });
    }

    async fn run_mature_block_sweep(&self) -> Result<(), PoolError> {
        let unpaid = self.store.get_unpaid_blocks().await?;
        let now = kpool_util::now_secs();

        for block in unpaid {
            if now.saturating_sub(block.timestamp) < MATURE_SWEEP_AGE_SECS {
                continue;
            }
            let Some(hash) = decode_hash(&block.hash) else {
                warn!("unparseable block hash {} in store, skipping sweep", block.hash);
                continue;
            };

            let color = match self.node.get_current_block_color(&hash).await {
                Ok(color) => color,
                Err(err) => {
                    debug!("sweep: could not read block color for {}: {err}", block.hash);
                    continue;
                }
            };
            if !matches!(color, kpool_node::BlockColor::Blue) {
                continue;
            }

            match self.reconstruct_coinbase_amount(&block).await {
                Some(gross) => {
                    let fee = self.treasury.fee_of(gross);
                    let net = gross.saturating_sub(fee);
                    info!("sweep: reconstructed coinbase for block {} as {gross} (net {net})", block.hash);
                    if let Err(err) = self.distribute_matured(net).await {
                        error!("sweep: distribution failed for block {}: {err}", block.hash);
                    }
                }
                None => {
                    error!(
                        "sweep: coinbase reconstruction exhausted all four stages for block {}, marking paid to stop retrying",
                        block.hash
                    );
                    let _ = self.store.mark_block_paid(&block.hash).await;
                    let mut state = self.reward_state.write().await;
                    state.remove_all(std::slice::from_ref(&block.hash));
                }
            }
        }
        Ok(())
    }

    /// The four-stage fallback from spec §4.E.3, tried in order until one
    /// succeeds.
    async fn reconstruct_coinbase_amount(&self, block: &BlockRecord) -> Option<u64> {
        let utxos = self
            .node
            .get_utxos_by_addresses(std::slice::from_ref(&self.treasury.funding_address().to_string()))
            .await
            .ok()?;

        // Stage 1: by DAA score.
        if let Some(utxo) = utxos.iter().find(|u| u.is_coinbase && u.block_daa_score == block.daa_score) {
            return Some(utxo.amount);
        }

        let hash = decode_hash(&block.hash)?;
        let info = self.node.get_block(&hash).await.ok().flatten();

        // Stage 2: by transaction ID.
        if let Some(info) = &info {
            if let Some(tx_id) = info.coinbase_tx_id {
                if let Some(utxo) = utxos.iter().find(|u| u.transaction_id == tx_id) {
                    return Some(utxo.amount);
                }
            }
        }

        // Stage 3: by script-decoding (the node already resolves each
        // coinbase output to its paying address for us).
        if let Some(info) = &info {
            if let Some(output) = info.coinbase_outputs.iter().find(|o| o.address == self.treasury.funding_address()) {
                return Some(output.amount);
            }
        }

        // Stage 4: forwarded UTXO within the DAA window.
        utxos
            .iter()
            .filter(|u| u.block_daa_score.abs_diff(block.daa_score) <= FORWARDED_UTXO_DAA_WINDOW)
            .min_by_key(|u| u.block_daa_score.abs_diff(block.daa_score))
            .map(|u| u.amount)
    }
}


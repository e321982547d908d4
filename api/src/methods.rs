//! Route handlers for the read-only API. Every address in a response is
//! externalized (`kaspa:`-prefixed) before it leaves this crate; the Store
//! itself only ever sees the canonical form (spec §9 "Address/prefix
//! policy").

use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use kpool_store::{BlockRecord, MinerRecord};
use kpool_util::externalize;

use crate::{ApiContext, ApiError, ListParams};

#[derive(Debug, Serialize)]
pub struct MinerView {
    pub address: String,
    /// Sompi can exceed 2^53; serialized as a JSON string (spec §6
    /// "Persistence layout"), same as the underlying `MinerRecord`.
    #[serde(with = "kpool_util::serde_amount")]
    pub pending_balance: u64,
    #[serde(with = "kpool_util::serde_amount::option")]
    pub payment_threshold: Option<u64>,
    pub payment_interval_hours: Option<u64>,
    pub last_payout_time: u64,
    pub blocks_found: u64,
}

impl MinerView {
    fn from_record(address: &str, record: MinerRecord) -> Self {
        MinerView {
            address: externalize(address),
            pending_balance: record.pending_balance,
            payment_threshold: record.payment_threshold,
            payment_interval_hours: record.payment_interval_hours,
            last_payout_time: record.last_payout_time,
            blocks_found: record.blocks_found,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BlockView {
    pub hash: String,
    pub finder: String,
    pub timestamp: u64,
    pub finder_difficulty: f64,
    pub daa_score: u64,
    pub paid: bool,
    pub contributor_count: usize,
}

impl From<BlockRecord> for BlockView {
    fn from(record: BlockRecord) -> Self {
        BlockView {
            hash: record.hash,
            finder: externalize(&record.finder),
            timestamp: record.timestamp,
            finder_difficulty: record.finder_difficulty.to_f64(),
            daa_score: record.daa_score,
            paid: record.paid,
            contributor_count: record.contributions.len(),
        }
    }
}

pub async fn get_all_miners(Extension(context): Extension<ApiContext>) -> Result<Json<Value>, ApiError> {
    let miners = context
        .store
        .get_all_miners()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let views: Vec<MinerView> = miners
        .into_iter()
        .map(|(address, record)| MinerView::from_record(&address, record))
        .collect();
    Ok(Json(json!({ "miners": views })))
}

pub async fn get_miner(
    Extension(context): Extension<ApiContext>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let canonical = kpool_util::canonicalize(&address).map_err(|err| ApiError::NotFound(err.to_string()))?;
    let record = context
        .store
        .get_miner(&canonical)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(json!(MinerView::from_record(&canonical, record))))
}

pub async fn get_blocks(
    Extension(context): Extension<ApiContext>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let blocks = context
        .store
        .get_blocks(params.limit)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let views: Vec<BlockView> = blocks.into_iter().map(BlockView::from).collect();
    Ok(Json(json!({ "blocks": views })))
}

pub async fn get_blocks_by_address(
    Extension(context): Extension<ApiContext>,
    Path(address): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let canonical = kpool_util::canonicalize(&address).map_err(|err| ApiError::NotFound(err.to_string()))?;
    let blocks = context
        .store
        .get_blocks_by_address(&canonical, params.limit)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let views: Vec<BlockView> = blocks.into_iter().map(BlockView::from).collect();
    Ok(Json(json!({ "blocks": views })))
}

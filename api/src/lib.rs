//! The optional read-only HTTP API (spec §6 `api.enabled`/`api.port`): a
//! thin JSON projection of the Store's miner, block and payment records.
//! Nothing here mutates state — payouts and block recording only ever
//! happen through `kpool-pool`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::CorsLayer;

use kpool_store::Store;

pub mod methods;

pub use methods::*;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Everything a route handler needs: just the Store. The API never holds
/// the Pool, the Treasury or the node client — it only reads what has
/// already been persisted.
#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn Store>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
}

/// Pagination query parameter shared by the block-listing routes.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub struct ApiServer {
    config: ApiConfig,
    context: ApiContext,
}

impl ApiServer {
    pub fn new(config: ApiConfig, context: ApiContext) -> Self {
        ApiServer { config, context }
    }

    pub async fn start(&self) -> Result<(), std::io::Error> {
        info!("read-only API listening on {}", self.config.bind_addr);

        let app = Router::new()
            .route("/miners", get(methods::get_all_miners))
            .route("/miners/:address", get(methods::get_miner))
            .route("/blocks", get(methods::get_blocks))
            .route("/blocks/:address", get(methods::get_blocks_by_address))
            .layer(Extension(self.context.clone()))
            .layer(CorsLayer::permissive());

        axum::Server::bind(&self.config.bind_addr)
            .serve(app.into_make_service())
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}


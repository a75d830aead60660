//! HTTP API for health checks, status, and monitoring

use crate::chain::{ChainClient, SettlementChain};
use crate::config::ApiConfig;
use crate::error::SettlerResult;
use crate::settle::submitter::{BatchSubmitter, CycleSummary};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<ChainClient>,
    pub submitter: Arc<BatchSubmitter>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    chain: Arc<ChainClient>,
    submitter: Arc<BatchSubmitter>,
) -> SettlerResult<()> {
    let state = AppState { chain, submitter };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the chain endpoint answers for the configured
/// network
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chain_ok = state.chain.verify_connectivity().await.is_ok();

    let code = if chain_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadinessResponse {
            ready: chain_ok,
            chain: chain_ok,
        }),
    )
}

/// Get settler status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        chain_id: state.chain.chain_id(),
        network: state.chain.network_name().to_string(),
        wallet_address: format!("{:?}", state.chain.wallet_address()),
        settlement_in_flight: state.submitter.is_running(),
        last_cycle: state.submitter.last_cycle().await,
    })
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    chain: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    chain_id: u64,
    network: String,
    wallet_address: String,
    settlement_in_flight: bool,
    last_cycle: Option<CycleSummary>,
}

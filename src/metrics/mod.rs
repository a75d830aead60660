//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Settlement cycle counts and outcome classification
//! - Batch size and cycle duration distributions
//! - Chain connection status and block height
//! - Signing wallet balance

use crate::error::SettlerResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Cycle metrics
    pub static ref CYCLES_STARTED: CounterVec = register_counter_vec!(
        "settler_cycles_started_total",
        "Total settlement cycles started",
        &[]
    ).unwrap();

    pub static ref CYCLE_OUTCOMES: CounterVec = register_counter_vec!(
        "settler_cycle_outcomes_total",
        "Settlement cycle outcomes by classification",
        &["outcome"]
    ).unwrap();

    pub static ref BATCH_SIZE: Histogram = register_histogram!(
        "settler_batch_size",
        "Agreement identifiers per submitted batch",
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]
    ).unwrap();

    pub static ref CYCLE_DURATION: Histogram = register_histogram!(
        "settler_cycle_duration_seconds",
        "Wall-clock duration of a settlement cycle",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_BROADCAST: CounterVec = register_counter_vec!(
        "settler_transactions_broadcast_total",
        "Total transactions accepted by a node",
        &[]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: Gauge = register_gauge!(
        "settler_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)"
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: Gauge = register_gauge!(
        "settler_chain_block_height",
        "Latest observed block height"
    ).unwrap();

    // Wallet metrics
    pub static ref WALLET_BALANCE: Gauge = register_gauge!(
        "settler_wallet_balance_eth",
        "Signing wallet balance in native units"
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "settler_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "settler_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SettlerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_cycle_started() {
    CYCLES_STARTED.with_label_values(&[]).inc();
}

pub fn record_cycle_outcome(outcome: &str) {
    CYCLE_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_batch_size(size: usize) {
    BATCH_SIZE.observe(size as f64);
}

pub fn record_cycle_duration(secs: f64) {
    CYCLE_DURATION.observe(secs);
}

pub fn record_tx_broadcast() {
    TX_BROADCAST.with_label_values(&[]).inc();
}

pub fn record_chain_health(healthy: bool) {
    CHAIN_CONNECTED.set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(block_number: u64) {
    CHAIN_BLOCK_HEIGHT.set(block_number as f64);
}

pub fn record_wallet_balance(balance_native: f64) {
    WALLET_BALANCE.set(balance_native);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

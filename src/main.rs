//! Batch Settler - scheduled on-chain settlement of agreement batches
//!
//! On a fixed schedule the settler collects the agreement identifiers that
//! are due, submits one batch transaction to the settlement contract, and
//! waits for confirmation, classifying the outcome. The contract is trusted
//! to skip identifiers that are already settled, which is what makes
//! resubmission after an indeterminate cycle safe.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod metrics;
mod settle;

use chain::{ChainClient, SettlementChain};
use config::Settings;
use error::SettlerError;
use metrics::MetricsServer;
use settle::fee::FeePolicy;
use settle::scheduler::SettlementScheduler;
use settle::submitter::BatchSubmitter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting batch settler v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Instance {} configured for {} (chain id {})",
        settings.settler.instance_id, settings.chain.name, settings.chain.chain_id
    );

    // Build the chain client: descriptor, signing key, provider list
    let chain = Arc::new(ChainClient::connect(&settings)?);

    match chain.verify_connectivity().await {
        Ok(identity) => info!(
            "Connected to {} (chain id {})",
            identity.name, identity.chain_id
        ),
        Err(e @ SettlerError::NetworkUnreachable(_)) => {
            warn!("Node unreachable at startup, cycles will retry: {}", e);
        }
        Err(e) => return Err(e.into()),
    }

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Identifier source for scheduled cycles
    let source = settle::source::from_config(&settings.source)?;
    info!("Identifier source: {}", source.describe());

    // Submission pipeline; an invalid fee policy is refused here
    let fee_policy = FeePolicy::from_config(&settings.fees);
    let submitter = Arc::new(BatchSubmitter::new(
        chain.clone(),
        fee_policy,
        Duration::from_secs(settings.settler.confirmation_timeout_secs),
    )?);

    let scheduler = Arc::new(SettlementScheduler::new(
        settings.schedule.clone(),
        source,
        submitter.clone(),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let chain = chain.clone();
        let submitter = submitter.clone();
        async move {
            if let Err(e) = api::run_server(api_config, chain, submitter).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if let Some(server) = metrics_server {
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start the settlement scheduler
    let scheduler_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            scheduler.run().await;
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain = chain.clone();
        let interval = settings.settler.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                match chain.get_block_number().await {
                    Ok(block) => {
                        metrics::record_chain_health(true);
                        metrics::record_block_height(block);
                    }
                    Err(e) => {
                        warn!("Chain health check failed: {}", e);
                        metrics::record_chain_health(false);
                        metrics::record_health_check_failure();
                        continue;
                    }
                }

                match chain.get_balance().await {
                    Ok(balance) => metrics::record_wallet_balance(to_native_units(balance)),
                    Err(e) => warn!("Balance check failed: {}", e),
                }

                metrics::record_health_check();
            }
        }
    });

    info!("Batch settler is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    scheduler.stop().await;

    // Abort background tasks
    api_handle.abort();
    scheduler_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Batch settler stopped");
    Ok(())
}

/// Gauge-friendly wallet balance; gwei precision is plenty for alerting.
fn to_native_units(wei: ethers::types::U256) -> f64 {
    (wei / ethers::types::U256::exp10(9)).low_u64() as f64 / 1e9
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,batch_settler=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

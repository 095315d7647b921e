//! TON transaction manager service
//!
//! Runs the transaction manager for the configured sender wallets against a toncenter
//! node, with the health/status API and Prometheus metrics alongside.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use ton_txm::api;
use ton_txm::chain::{CompiledContract, ToncenterClient};
use ton_txm::config::{LoggingConfig, Settings};
use ton_txm::keystore::InMemoryKeystore;
use ton_txm::metrics::{self, MetricsServer};
use ton_txm::tx::StaticFeeEstimator;
use ton_txm::Txm;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(&settings.logging);

    info!("Starting TON transaction manager v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration for {} sender wallets", settings.wallets.len());

    let keystore = Arc::new(InMemoryKeystore::new());
    for seed in &settings.keystore.seeds {
        let key_id = keystore.add_seed_hex(seed)?;
        info!("Loaded signing key {}", key_id);
    }

    let node = Arc::new(ToncenterClient::new(&settings.node)?);
    let fees = Arc::new(StaticFeeEstimator::new(settings.fees.clone()));

    let mut txm = Txm::new(
        settings.txm.clone(),
        settings.identities()?,
        node,
        keystore,
        fees,
    )?;
    for wallet in &settings.wallets {
        if let Some(path) = &wallet.code_path {
            let identity = wallet.identity()?;
            let compiled = CompiledContract::load(path)
                .with_context(|| format!("Failed to load wallet code for {}", wallet.address))?;
            txm = txm.with_deploy_code(identity.address, compiled.code);
        }
    }
    let txm = Arc::new(txm);
    txm.start().await?;

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let txm = txm.clone();
        async move {
            if let Err(e) = api::run_server(config, txm).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let txm = txm.clone();
        async move {
            loop {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;

                let mut healthy = true;
                for (component, problem) in txm.health_report() {
                    if let Some(problem) = problem {
                        warn!("{} health check failed: {}", component, problem);
                        healthy = false;
                    }
                }
                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }

                let (queued, unconfirmed) = txm.inflight_count();
                info!("{} queued, {} unconfirmed", queued, unconfirmed);
            }
        }
    });

    info!("{} is running", txm.name());
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    if let Err(e) = txm.close().await {
        error!("Transaction manager did not close cleanly: {}", e);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("TON transaction manager stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            config
                .filter
                .as_deref()
                .unwrap_or("info,ton_txm=debug,hyper=warn,reqwest=warn"),
        )
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

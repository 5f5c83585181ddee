//! Oracle transaction manager node
//!
//! Runs one confirmer per configured chain against a Postgres ledger and
//! serves the ops API and Prometheus metrics.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use oracle_txm::api;
use oracle_txm::chain::ChainManager;
use oracle_txm::config::{LogFormat, LoggingConfig, Settings};
use oracle_txm::engine::{ChainContext, Confirmer, QueueLimits, TxManager};
use oracle_txm::keystore::LocalKeystore;
use oracle_txm::locks::{AccountLeases, AccountLocks, PgAdvisoryLeases};
use oracle_txm::metrics::{self, MetricsServer};
use oracle_txm::store::{PgTxStore, TxStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(&settings.logging);

    info!(
        "Starting oracle-txm v{} (instance {})",
        env!("CARGO_PKG_VERSION"),
        settings.node.instance_id
    );
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize database connection
    let pg_store = Arc::new(PgTxStore::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    pg_store.run_migrations().await?;
    info!("Database migrations complete");

    let leases: Arc<dyn AccountLeases> = Arc::new(PgAdvisoryLeases::new(pg_store.pool().clone()));
    let store: Arc<dyn TxStore> = pg_store;

    let keystore = Arc::new(LocalKeystore::from_config(&settings.keys)?);

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings).await?);
    info!(
        "Chain connections initialized: {:?}",
        chain_manager.connected_chains()
    );

    let locks = Arc::new(AccountLocks::new());
    let limits = QueueLimits {
        max_queued: settings.node.max_queued,
        max_in_flight: settings.node.max_in_flight,
    };
    let manager = Arc::new(TxManager::new(store.clone(), leases.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut confirmer_handles = Vec::new();

    for (name, chain) in settings.enabled_chains() {
        let policy = chain
            .gas_policy()
            .with_context(|| format!("Invalid gas policy for chain {}", name))?;
        let ctx = Arc::new(ChainContext::new(
            chain_manager.get_client(chain.chain_id)?,
            store.clone(),
            keystore.clone(),
            policy,
            settings.broadcast.retry_policy(),
            locks.clone(),
            limits,
        ));
        manager.add_chain(ctx.clone());

        let mut confirmer =
            Confirmer::new(ctx, leases.clone(), settings.node.process_head_timeout());
        if let Some(reaper) = settings.reaper.policy() {
            confirmer = confirmer.with_reaper(reaper);
        }
        let shutdown = shutdown_rx.clone();
        let chain_id = chain.chain_id;
        confirmer_handles.push(tokio::spawn(async move {
            if let Err(e) = confirmer.run(shutdown).await {
                error!("Confirmer for chain {} stopped: {}", chain_id, e);
            }
        }));
    }
    info!("Confirmers started for chains {:?}", manager.chain_ids());

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let manager = manager.clone();
        let chain_manager = chain_manager.clone();
        async move {
            if let Err(e) = api::run_server(api_config, manager, chain_manager).await {
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
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.node.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain_id, chain_ok) in chain_manager.health_check().await {
                    if !chain_ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Database health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("oracle-txm is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Let confirmers finish the head they are on
    let _ = shutdown_tx.send(true);
    for handle in confirmer_handles {
        if tokio::time::timeout(settings.node.process_head_timeout(), handle)
            .await
            .is_err()
        {
            warn!("Confirmer did not stop in time");
        }
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("oracle-txm stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
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

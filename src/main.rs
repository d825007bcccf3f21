//! txguard - idempotent transaction submission for EVM chains
//!
//! Reserves nonces per signing address, prices and signs EIP-1559
//! transactions, and submits them at most once per request id.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod intent;
mod metrics;
mod nonce;
mod signer;
mod state;
mod tx;

#[cfg(test)]
mod testing;

use api::AppState;
use chain::{ChainClient, ChainProvider};
use config::{NonceStoreKind, Settings};
use metrics::MetricsServer;
use nonce::{
    DistributedNonceStore, HybridNonceStore, InProcessNonceStore, NonceManager, NonceStore,
    RedisBackend,
};
use signer::TransactionSigner;
use state::{IntentStore, MemoryIntentStore, PgIntentStore};
use tx::{GasPolicy, TransactionPipeline, TransactionSender, TxBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting txguard v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({}), instance {}",
        settings.chain.name, settings.chain.chain_id, settings.service.instance_id
    );

    let chain: Arc<dyn ChainClient> = Arc::new(ChainProvider::new(settings.chain.clone())?);
    info!("Chain client initialized");

    let intents = build_intent_store(&settings).await?;

    let nonce_store = build_nonce_store(&settings, chain.clone()).await?;
    let nonces = Arc::new(NonceManager::new(nonce_store));
    info!("Nonce store ready ({})", nonces.active_store());

    let signer: Arc<dyn TransactionSigner> =
        Arc::new(signer::from_config(&settings.signer, chain.chain_id()).await?);
    info!(
        "Signer {:?} ready ({} backend)",
        signer.address(),
        signer.backend()
    );

    let gas = Arc::new(GasPolicy::new(chain.clone(), &settings.gas));
    let builder = TxBuilder::new(chain.clone(), &settings.sender);
    let sender = Arc::new(TransactionSender::new(
        chain.clone(),
        intents.clone(),
        &settings.sender,
    ));
    let pipeline = Arc::new(TransactionPipeline::new(
        nonces,
        gas,
        builder,
        signer,
        sender,
        intents.clone(),
        &settings.sender,
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            pipeline: pipeline.clone(),
            chain: chain.clone(),
            intent_bucket_secs: settings.sender.intent_bucket_secs,
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
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
        let chain = chain.clone();
        let intents = intents.clone();
        let pipeline = pipeline.clone();
        let coordinated = settings.nonce.store != NonceStoreKind::Memory;
        let interval = settings.service.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let chain_healthy = chain.health_check().await;
                metrics::record_chain_health(chain.chain_id(), chain_healthy);
                if !chain_healthy {
                    warn!("Chain {} health check failed", chain.chain_id());
                }

                if coordinated {
                    metrics::set_store_degraded(
                        pipeline.nonce_store() == nonce::StoreKind::InProcess,
                    );
                }

                match intents.health_check().await {
                    Ok(()) if chain_healthy => metrics::record_health_check(),
                    Ok(()) => metrics::record_health_check_failure(),
                    Err(e) => {
                        warn!("Intent store health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("txguard is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("txguard stopped");
    Ok(())
}

async fn build_intent_store(settings: &Settings) -> Result<Arc<dyn IntentStore>> {
    match settings.database.url.as_deref() {
        Some(url) => {
            let store = PgIntentStore::new(url, &settings.database).await?;
            info!("Database connection established");

            store.run_migrations().await?;
            info!("Database migrations complete");

            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryIntentStore::new())),
    }
}

async fn build_nonce_store(
    settings: &Settings,
    chain: Arc<dyn ChainClient>,
) -> Result<Arc<dyn NonceStore>> {
    let config = &settings.nonce;
    let redis_url = config.redis_url.as_deref().unwrap_or_default();

    let store: Arc<dyn NonceStore> = match config.store {
        NonceStoreKind::Memory => Arc::new(InProcessNonceStore::with_chain(chain)),
        NonceStoreKind::Distributed => {
            let backend = Arc::new(RedisBackend::connect(redis_url).await?);
            metrics::set_store_degraded(false);
            Arc::new(DistributedNonceStore::new(backend, chain, config))
        }
        NonceStoreKind::Hybrid => match RedisBackend::connect(redis_url).await {
            Ok(backend) => {
                metrics::set_store_degraded(false);
                let distributed = DistributedNonceStore::new(Arc::new(backend), chain.clone(), config);
                Arc::new(HybridNonceStore::new(distributed, chain))
            }
            Err(e) => {
                error!(
                    "Coordination service unreachable at startup ({}), running in degraded in-process mode",
                    e
                );
                metrics::record_store_fallback();
                Arc::new(InProcessNonceStore::with_chain(chain))
            }
        },
    };

    Ok(store)
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,txguard=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
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

//! Clearing Server Binary

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;

use robopay_clearing::scheduler::LedgerExecutor;
use robopay_clearing::{
    ClearingConfig, EscrowEngine, EventBus, Ledger, MemoryStorage, PaymentScheduler, PostgresOptions,
    PostgresStorage, Storage, StorageBackend,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    tracing::info!("Robopay clearing engine starting...");

    let config = ClearingConfig::from_env();
    let storage: Arc<dyn Storage> = match config.storage.backend {
        StorageBackend::Postgres => {
            let url = config
                .storage
                .database_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("postgres backend selected but no database url set"))?;
            let mut options = PostgresOptions::new(url);
            options.max_connections = config.storage.max_connections;
            options.acquire_timeout = config.storage.acquire_timeout;
            Arc::new(PostgresStorage::connect(&options).await?)
        }
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };

    let events = Arc::new(EventBus::new());
    let ledger = Arc::new(Ledger::new(storage.clone(), events.clone(), config.clone()));
    let escrow = Arc::new(EscrowEngine::new(storage.clone(), events.clone(), config.clone()));

    let scheduler = Arc::new(PaymentScheduler::new(
        storage,
        events,
        Arc::new(LedgerExecutor::new(ledger)),
        config.scheduler.clone(),
    ));
    let _scheduler_handle = scheduler.start();
    let _sweeper_handle = escrow.spawn_sweeper(config.scheduler.check_interval);

    let app = Router::new().route("/health", get(|| async { "OK" }));

    let addr = SocketAddr::from(([0, 0, 0, 0], 3003));
    tracing::info!("Clearing engine listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

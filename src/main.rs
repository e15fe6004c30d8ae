//! Herald change notification service.
//!
//! Main entry point for the Herald server. Loads configuration, selects the
//! storage backend, starts the pipeline workers and serves the
//! administrative API until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_api::{AppState, Config, StorageBackend};
use herald_core::{
    storage::{postgres, Storage},
    Clock, RealClock, TracingEventHandler,
};
use herald_delivery::PipelineEngine;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!(
        backend = ?config.storage_backend,
        host = %config.host,
        port = config.port,
        partition_limit = config.partition_limit,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = create_storage(&config, clock.clone()).await?;

    let mut engine = PipelineEngine::new(
        storage.clone(),
        config.to_pipeline_config(),
        clock.clone(),
        Arc::new(TracingEventHandler),
    )
    .context("Failed to create pipeline engine")?;
    engine.start().await.context("Failed to start pipeline workers")?;
    info!(
        partition_workers = config.partition_workers,
        spread_workers = config.spread_workers,
        delivery_workers = config.delivery_workers,
        "Pipeline started"
    );

    let state = AppState::new(storage, engine.ingestor(), clock)
        .with_request_timeout(Duration::from_secs(config.request_timeout));
    let addr = config.parse_server_addr()?;

    herald_api::start_server(state, addr).await.context("HTTP server failed")?;

    let stats = engine.stats().await;
    engine.shutdown().await.context("Pipeline shutdown failed")?;
    info!(
        processed = stats.messages_processed,
        delivered = stats.notifications_delivered,
        "Herald shutdown complete"
    );
    Ok(())
}

/// Initializes tracing with the configured filter.
fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives).context("Invalid RUST_LOG directives")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

async fn create_storage(config: &Config, clock: Arc<dyn Clock>) -> Result<Storage> {
    match config.storage_backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage; state is lost on restart");
            Ok(Storage::memory(config.to_store_config(), clock))
        },
        StorageBackend::Postgres => {
            info!(database_url = %config.database_url_masked(), "Connecting to PostgreSQL");
            let pool = create_database_pool(config).await?;
            postgres::migrate(&pool).await.context("Failed to run database migrations")?;
            info!("Database migrations completed");
            Ok(Storage::postgres(pool, config.to_store_config(), clock))
        },
    }
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

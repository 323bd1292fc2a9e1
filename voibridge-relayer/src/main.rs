//! VOI to Algorand bridge relayer.
//!
//! Watches the source validator's deposit logs and pays each valid deposit
//! out exactly once through the destination escrow.

mod api;
mod config;
mod server;
mod shutdown;
mod state;

use clap::{Parser, ValueEnum};
use config::{ConfigLoader, get_database_url};
use server::{build_router, run_server};
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use voibridge_core::chain::AlgorandChain;
use voibridge_core::deposit::DepositValidator;
use voibridge_core::processors::executor::PayoutExecutor;
use voibridge_core::processors::ingestion::IngestionRunner;
use voibridge_core::processors::log_source::IndexerLogSource;
use voibridge_core::processors::reconciler::Reconciler;
use voibridge_core::store::{DedupStore, MemoryDedupStore, PgDedupStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// Durable Postgres store (requires DATABASE_URL)
    Postgres,
    /// In-memory store for dry runs; state is lost on exit
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// VOI to Algorand bridge relayer
#[derive(Parser, Debug)]
#[command(name = "voibridge-relayer")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "VOIBRIDGE_CONFIG", default_value = "./voibridge.toml")]
    config: PathBuf,

    /// Override the operator API listen address (e.g., 127.0.0.1:8080)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Dedup store backend
    #[arg(long, value_enum, env = "VOIBRIDGE_STORE", default_value = "postgres")]
    store: StoreKind,

    /// Log output format
    #[arg(long, value_enum, env = "VOIBRIDGE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    tracing::info!("Starting voibridge-relayer v{}", env!("CARGO_PKG_VERSION"));

    let config = ConfigLoader::new(&args.config, args.listen)
        .load()
        .map_err(|e| {
            tracing::error!("Failed to load configuration: {}", e);
            e
        })?;
    tracing::info!(
        validator_app_id = config.source.validator_app_id,
        escrow_app_id = config.destination.escrow_app_id,
        "Configuration loaded from {:?}",
        args.config
    );

    let (store, db_pool) = match args.store {
        StoreKind::Postgres => {
            let database_url = get_database_url().map_err(|e| {
                tracing::error!("DATABASE_URL environment variable not set");
                e
            })?;

            tracing::info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&database_url)
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to database: {}", e);
                    e
                })?;
            tracing::info!("Database connection established");

            if args.migrate {
                tracing::info!("Running database migrations...");
                sqlx::migrate!("../migrations")
                    .run(&db_pool)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to run migrations: {}", e);
                        e
                    })?;
                tracing::info!("Migrations completed successfully");
            }

            let store: Arc<dyn DedupStore> = Arc::new(PgDedupStore::new(db_pool.clone()));
            (store, Some(db_pool))
        }
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store; dedup state is lost on exit");
            let store: Arc<dyn DedupStore> = Arc::new(MemoryDedupStore::new());
            (store, None)
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let chain = Arc::new(AlgorandChain::new(
        config.destination.clone(),
        config.signer.clone(),
    ));
    match chain.signer_address().await {
        Ok(address) => tracing::info!(relayer = %address, "Signer key resolved"),
        Err(e) => tracing::warn!(error = %e, "Signer unavailable at startup"),
    }

    let executor = Arc::new(PayoutExecutor::new(
        store.clone(),
        chain.clone(),
        config.pipeline.clone(),
        shutdown_rx.clone(),
    ));
    let ingestion = IngestionRunner::new(
        Arc::new(IndexerLogSource::new(&config.source)),
        DepositValidator::new(&config.source, &config.rules),
        store.clone(),
        executor.clone(),
        config.source.clone(),
        config.pipeline.clone(),
        shutdown_rx.clone(),
    );
    let reconciler = Reconciler::new(
        store.clone(),
        chain,
        executor,
        config.reconciler.clone(),
        shutdown_rx,
    );

    let ingestion_handle = tokio::spawn(ingestion.run());
    let reconciler_handle = tokio::spawn(reconciler.run());

    let router = build_router(AppState::new(store));
    tracing::info!("Starting HTTP server on {}", config.listen);
    let result = run_server(router, config.listen, shutdown_tx.clone()).await;

    // Also stops the pipeline when the server failed to start.
    let _ = shutdown_tx.send(true);
    tracing::info!("Waiting for pipeline tasks to finish...");
    let (ingestion_result, reconciler_result) = tokio::join!(ingestion_handle, reconciler_handle);
    for task_result in [ingestion_result, reconciler_result] {
        if let Err(e) = task_result {
            tracing::error!(error = %e, "Pipeline task panicked");
        }
    }

    if let Some(db_pool) = db_pool {
        tracing::info!("Closing database connections...");
        db_pool.close().await;
    }
    tracing::info!("Relayer shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

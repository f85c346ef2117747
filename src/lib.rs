//! Kassa - fiscal point-of-sale transaction server.
//!
//! The transactional core of a restaurant/retail POS under German fiscal
//! compliance (DSFinV-K / TSE): receipt lifecycle, an append-only signed
//! fiscal log with two-phase commit, storno credit accounting with manager
//! approval, startup recovery, a deduplicating WebSocket command channel,
//! and hybrid catalog search.
//!
//! Wiring happens once in [`AppState::initialize`]; there are no ambient
//! singletons. The startup order is fixed: schema validation, admin
//! bootstrap, fiscal replay, stale-transaction marking, credit reset, then
//! the listening socket.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod auth;
pub mod commands;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod embeddings;
pub mod error;
pub mod fiscal;
pub mod import;
pub mod layouts;
pub mod models;
pub mod money;
pub mod printer;
pub mod recovery;
pub mod repository;
pub mod search;
pub mod signer;
pub mod storno;
pub mod transactions;

use config::Config;
use embeddings::{EmbeddingProvider, HashEmbeddingProvider, HttpEmbeddingProvider};
use error::PosResult;
use printer::{LogPrinter, ReceiptPrinter};
use signer::{FiscalSigner, HttpTseSigner, LocalSigner};

/// Capacity of the broadcast fan-out channel.
const BROADCAST_CAPACITY: usize = 64;

/// Everything the dispatcher and command adapters share. Constructed once
/// at startup and passed by reference.
pub struct AppState {
    pub db: Arc<db::DbState>,
    pub auth: Arc<auth::AuthState>,
    pub engine: Arc<transactions::Engine>,
    pub storno: Arc<storno::StornoService>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub processed_ops: dispatcher::ProcessedOps,
    pub broadcast: broadcast::Sender<String>,
}

impl AppState {
    /// Open the database, run the startup sequence, and wire the services.
    pub fn initialize(config: &Config) -> PosResult<Arc<Self>> {
        let db = Arc::new(db::init(&config.db_path)?);

        // Startup recovery runs before any client traffic.
        let report = recovery::run_startup(&db)?;
        if report.admin_created {
            warn!("Default administrator created; change its password immediately");
        }

        let signer: Arc<dyn FiscalSigner> = if config.tse_url.is_empty() {
            warn!("No TSE endpoint configured; using in-process signer");
            Arc::new(LocalSigner::new())
        } else {
            Arc::new(HttpTseSigner::new(
                config.tse_url.clone(),
                config.tse_api_key.clone(),
                config.tse_timeout,
            )?)
        };

        let embedder: Arc<dyn EmbeddingProvider> = if config.embeddings_url.is_empty() {
            warn!("No embedding endpoint configured; using hash embeddings");
            Arc::new(HashEmbeddingProvider)
        } else {
            Arc::new(HttpEmbeddingProvider::new(
                config.embeddings_url.clone(),
                config.embeddings_api_key.clone(),
                config.embeddings_timeout,
            )?)
        };

        // Printer configuration is best-effort by contract.
        let receipt_printer: Arc<dyn ReceiptPrinter> = Arc::new(LogPrinter);

        let tax_rules = money::TaxRules::with_overrides(&config.tax_rules);
        let engine = Arc::new(transactions::Engine::new(
            db.clone(),
            signer.clone(),
            receipt_printer,
            tax_rules,
        ));
        let storno_service = Arc::new(storno::StornoService::new(db.clone(), signer));

        // Idempotent per business day; also re-armed by the dispatcher on
        // day rollover.
        storno_service.reset_daily_storno_credits(&models::business_date_today())?;

        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        Ok(Arc::new(AppState {
            db,
            auth: Arc::new(auth::AuthState::new()),
            engine,
            storno: storno_service,
            embedder,
            processed_ops: dispatcher::ProcessedOps::new(),
            broadcast: broadcast_tx,
        }))
    }

    /// Fully wired state over an in-memory database (test helper).
    #[cfg(test)]
    pub fn for_tests() -> Arc<Self> {
        let db = Arc::new(db::test_db());
        let signer: Arc<dyn FiscalSigner> = Arc::new(LocalSigner::new());
        let engine = Arc::new(transactions::Engine::new(
            db.clone(),
            signer.clone(),
            Arc::new(LogPrinter),
            money::TaxRules::default_rules(),
        ));
        let storno_service = Arc::new(storno::StornoService::new(db.clone(), signer));
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(AppState {
            db,
            auth: Arc::new(auth::AuthState::new()),
            engine,
            storno: storno_service,
            embedder: Arc::new(HashEmbeddingProvider),
            processed_ops: dispatcher::ProcessedOps::new(),
            broadcast: broadcast_tx,
        })
    }
}

/// Initialize tracing: env-filtered stdout plus a daily-rolled file next to
/// the database. Returns the appender guard; dropping it stops file output.
pub fn init_tracing(config: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = config
        .db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let file_appender = tracing_appender::rolling::daily(log_dir, "kassa-server.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .init();

    guard
}

/// Run the server until the process is stopped.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::initialize(&config)?;

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Kassa server listening");

    axum::serve(listener, dispatcher::router(state)).await?;
    Ok(())
}

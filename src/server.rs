//! Process bootstrap for the compliance ledger.
//!
//! This module wires together:
//! - configuration
//! - database connection pool (Postgres, or SQLite for single-node setups)
//! - the certificate vault, authority client and delivery pipeline
//! - the scheduled recovery worker and graceful shutdown

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::LedgerConfig;
use crate::crypto::CertificateVault;
use crate::infra::{
    connect_sqlite, shutdown_signal, CertificateStore, DeliveryLedger, DeliveryTracker,
    InMemoryInvoiceDirectory, InvoiceDirectory, PgCertificateStore, PgDeliveryLedger,
    PgInvoiceDirectory, Result, ShutdownCoordinator, SqliteCertificateStore,
    SqliteDeliveryLedger,
};
use crate::metrics::MetricsRegistry;
use crate::pipeline::{spawn_recovery_worker, DeliveryPipeline, RecoveryEngine, RecoveryWorkerMessage};
use crate::service::{build_authority, ComplianceService};
use crate::telemetry::{init_telemetry, TelemetryConfig};

/// How long shutdown waits for in-flight deliveries.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage handles behind the pipeline.
pub struct Backends {
    pub ledger: Arc<dyn DeliveryLedger>,
    pub certificates: Arc<dyn CertificateStore>,
    pub directory: Arc<dyn InvoiceDirectory>,
}

/// Connect to the configured database and run migrations.
///
/// `sqlite:` URLs get the SQLite ledger and an empty in-memory invoice
/// directory; everything else is treated as Postgres.
pub async fn connect_backends(config: &LedgerConfig) -> Result<Backends> {
    let url = config.require_database_url()?;

    if url.starts_with("sqlite:") {
        info!("Opening SQLite ledger");
        let pool = connect_sqlite(url, config.db_max_connections).await?;
        warn!("SQLite deployment has no invoice inbox; only recorded invoices are recovered");
        return Ok(Backends {
            ledger: Arc::new(SqliteDeliveryLedger::new(pool.clone())),
            certificates: Arc::new(SqliteCertificateStore::new(pool)),
            directory: Arc::new(InMemoryInvoiceDirectory::new()),
        });
    }

    info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(url)
        .await?;
    info!("Connected to PostgreSQL");

    crate::migrations::run_postgres(&pool).await?;
    info!("Database migrations applied");

    Ok(Backends {
        ledger: Arc::new(PgDeliveryLedger::new(pool.clone())),
        certificates: Arc::new(PgCertificateStore::new(pool.clone())),
        directory: Arc::new(PgInvoiceDirectory::new(pool)),
    })
}

/// Assemble the service from configuration and connected backends.
pub fn build_service(
    config: &LedgerConfig,
    backends: Backends,
    metrics: Arc<MetricsRegistry>,
    tracker: Option<Arc<DeliveryTracker>>,
) -> Result<ComplianceService> {
    let vault = Arc::new(CertificateVault::new(config.vault_keys.clone())?);
    let authority = build_authority(&config.authority, metrics.clone())?;

    let mut pipeline = DeliveryPipeline::new(
        backends.ledger,
        backends.certificates,
        backends.directory,
        authority,
        vault.clone(),
        config.chain_secret.clone(),
        config.pipeline.clone(),
    )
    .with_metrics(metrics);
    if let Some(tracker) = tracker {
        pipeline = pipeline.with_tracker(tracker);
    }

    Ok(ComplianceService::new(
        Arc::new(pipeline),
        vault,
        config.recovery.clone(),
    ))
}

/// Run the worker daemon until SIGINT/SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {e}"))?;

    info!("Starting compliance ledger v{}", env!("CARGO_PKG_VERSION"));

    let config = LedgerConfig::from_env()?;
    info!(?config, "Configuration loaded");

    let backends = connect_backends(&config).await?;
    let metrics = Arc::new(MetricsRegistry::new());
    let coordinator = ShutdownCoordinator::new();

    let service = build_service(
        &config,
        backends,
        metrics.clone(),
        Some(coordinator.tracker()),
    )?;

    let engine = RecoveryEngine::new(service.pipeline().clone(), config.recovery.clone());
    let (worker, control) = spawn_recovery_worker(engine, Some(coordinator.signal()));
    info!("Compliance ledger is running");

    shutdown_signal().await;

    coordinator.graceful_shutdown(DRAIN_TIMEOUT).await;
    // The worker may already have stopped on the shutdown signal.
    let _ = control.send(RecoveryWorkerMessage::Shutdown).await;
    if let Err(e) = worker.await {
        warn!(error = %e, "Recovery worker task ended abnormally");
    }

    info!(
        uptime_secs = metrics.uptime_seconds(),
        metrics = %metrics.to_json().await,
        "Compliance ledger stopped"
    );
    Ok(())
}

//! fleetwatch - multi-tenant database fleet monitoring.
//!
//! Runs the job scheduler, metric collector and retention loops for every
//! active tenant, plus a small operational HTTP server.

mod alert;
mod collector;
mod config;
mod crypto;
mod db;
mod pool;
mod probe;
mod scheduler;
mod web;

use alert::AlertEvaluator;
use collector::MetricCollector;
use config::ServerConfig;
use crypto::Cipher;
use db::TenantRegistry;
use pool::WorkerPool;
use probe::{MssqlClient, RemoteClient};
use scheduler::{default_handlers, JobExecutor, RetentionManager, Scheduler};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("fleetwatch=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting fleetwatch on port {}...", cfg.http_port);
    tracing::info!("Using data directory {}", cfg.data_dir);
    if cfg.uses_dev_key() {
        tracing::warn!("FLEETWATCH_ENCRYPTION_KEY is not set; using the development key");
    }

    let registry = Arc::new(TenantRegistry::open(&cfg.data_dir)?);
    let tenants = registry.list_active_tenants()?;
    tracing::info!("Tenant registry ready with {} active tenants", tenants.len());

    let cipher = Arc::new(Cipher::from_passphrase(&cfg.encryption_key)?);
    let client: Arc<dyn RemoteClient> = Arc::new(MssqlClient);
    let evaluator = Arc::new(AlertEvaluator::new(cfg.alert_resolve_threshold));

    let handlers = default_handlers(
        evaluator.clone(),
        client.clone(),
        cipher.clone(),
        cfg.collection_timeout,
    );
    let executor = Arc::new(JobExecutor::new(handlers, cfg.job_timeout));
    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        executor,
        WorkerPool::new("jobs", cfg.job_workers, cfg.queue_factor),
        cfg.scheduler_poll,
    ));
    let collector = Arc::new(MetricCollector::new(
        registry.clone(),
        client,
        cipher,
        evaluator,
        WorkerPool::new("collector", cfg.collector_workers, cfg.queue_factor),
        cfg.collector_poll,
        cfg.collection_timeout,
    ));
    let retention = Arc::new(RetentionManager::new(
        registry.clone(),
        cfg.retention_interval,
        cfg.retention_batch_size,
    ));

    scheduler.start();
    collector.start();
    retention.start();

    let server = Server::new(registry, cfg.http_port);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
    };
    let served = server.start(shutdown).await;

    scheduler.stop().await;
    collector.stop().await;
    retention.stop().await;
    tracing::info!("fleetwatch stopped");

    served
}

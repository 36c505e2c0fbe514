//! railyard engine
//!
//! Long-running process that reconciles deployments against the cluster and
//! orchestrates multi-service deployment groups. Serves health endpoints on
//! an internal address.

use std::sync::Arc;

use anyhow::{Context, Result};
use railyard_engine::{
    api,
    audit::{Audit, AuditSink, PgAuditSink, TracingAuditSink},
    cluster::{ClusterApi, HttpClusterClient, MockCluster},
    config,
    db::{Database, MemoryStore, Store},
    state::AppState,
    Engine,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to RAILYARD_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting railyard engine");
    info!(
        listen_addr = %config.listen_addr,
        workers = config.engine.worker_pool_size,
        "Configuration loaded"
    );

    let (store, audit_sink): (Arc<dyn Store>, Arc<dyn AuditSink>) = match &config.database {
        Some(db_config) => {
            let db = match Database::connect(db_config).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                db.run_migrations().await?;
            }
            (
                Arc::new(db.store()),
                Arc::new(PgAuditSink::new(db.pool().clone())),
            )
        }
        None => {
            warn!("No database configured, using in-memory store (dev mode)");
            (Arc::new(MemoryStore::new()), Arc::new(TracingAuditSink))
        }
    };

    let cluster: Arc<dyn ClusterApi> = if config.cluster.mock {
        warn!("Using mock cluster");
        Arc::new(MockCluster::new())
    } else {
        Arc::new(
            HttpClusterClient::new(&config.cluster).context("failed to build cluster client")?,
        )
    };

    let engine = Engine::start(config.engine.clone(), store, cluster, Audit::new(audit_sink))
        .await
        .context("failed to start engine")?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let app = api::create_router(AppState::new(engine.clone()));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for health checks");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, engine.shutdown())
        .await
        .is_err()
    {
        warn!("Engine did not shut down in time");
    }

    info!("Engine shutdown complete");
    Ok(())
}

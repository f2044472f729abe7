// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terrarun - Terraform Run Execution Daemon
//!
//! Picks up queued runs, drives them through plan and apply on the
//! configured backend and re-attaches to interrupted jobs after a restart.

use std::sync::Arc;
use tracing::{info, warn};

use terrarun_core::migrations;
use terrarun_core::persistence::{MemoryPersistence, Persistence, PostgresPersistence};
use terrarun_engine::backend::{ContainerBackend, ExecutionBackend, LocalBackend};
use terrarun_engine::config::{BackendKind, Config};
use terrarun_engine::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "terrarun_engine=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        backend = ?config.backend,
        data_dir = %config.data_dir.display(),
        persistent = config.database_url.is_some(),
        "Starting terrarun"
    );

    let persistence: Arc<dyn Persistence> = match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;
            info!("Connected to database");

            migrations::run_postgres(&pool).await?;
            info!("Database migrations applied");

            Arc::new(PostgresPersistence::new(pool))
        }
        None => {
            warn!("TERRARUN_DATABASE_URL not set, runs are kept in memory only");
            Arc::new(MemoryPersistence::new())
        }
    };

    let backend: Arc<dyn ExecutionBackend> = match config.backend {
        BackendKind::Local => Arc::new(LocalBackend::new(config.local_backend())),
        BackendKind::Container => Arc::new(ContainerBackend::connect(config.container_backend())?),
    };
    info!(backend_type = backend.backend_type(), "Backend initialized");

    let runtime = EngineRuntime::builder()
        .persistence(persistence)
        .backend(backend)
        .orchestrator_config(config.orchestrator())
        .scheduler_poll_interval(config.scheduler_poll_interval)
        .build()?
        .start()
        .await?;

    info!("terrarun ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("terrarun shut down");

    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use super::api::{self, AppState};
use super::db::{DbHandle, FactoryDb};
use crate::execution::ProcessWorkstreamRunner;
use crate::factory_config::{AdapterKind, FactoryToml};
use crate::router::{ExecutionAdapter, HttpExecutionAdapter, LocalExecutionAdapter};

/// Configuration for the factory server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3150,
            db_path: PathBuf::from(".factory/factory.db"),
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &FactoryToml) -> Self {
        Self {
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.dev,
        }
    }
}

/// Pick the execution adapter named by `[execution] adapter`.
pub fn build_adapter(config: &FactoryToml, db: &DbHandle) -> Arc<dyn ExecutionAdapter> {
    match config.execution.adapter {
        AdapterKind::Local => {
            let mut runner = ProcessWorkstreamRunner::new(&config.execution.agent_cmd);
            if let Some(dir) = &config.execution.working_dir {
                runner = runner.with_working_dir(dir.clone());
            }
            Arc::new(LocalExecutionAdapter::new(db.clone(), Arc::new(runner)))
        }
        AdapterKind::Http => Arc::new(HttpExecutionAdapter::new(&config.execution.base_url)),
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Open the database and fail builds a previous process left `RUNNING`;
/// their executors died with it.
pub fn open_database(path: &Path) -> Result<DbHandle> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = FactoryDb::new(path).context("Failed to initialize factory database")?;
    let interrupted = db
        .fail_interrupted_builds()
        .context("Failed to recover interrupted builds")?;
    if interrupted > 0 {
        warn!(builds = interrupted, "Marked interrupted builds as failed");
    }
    Ok(DbHandle::new(db))
}

/// Start the factory server and block until Ctrl+C.
pub async fn start_server(config: FactoryToml) -> Result<()> {
    let server = ServerConfig::from_config(&config);

    let db = open_database(&server.db_path)?;
    let adapter = build_adapter(&config, &db);
    info!(adapter = adapter.name(), "Execution adapter selected");

    let state = Arc::new(AppState::new(db, &config, adapter));
    let shutdown = state.shutdown.clone();

    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Agent Factory running at http://{}", local_addr);
    info!(addr = %local_addr, db = %server.db_path.display(), "Server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
    // Open SSE streams would otherwise hold graceful shutdown open.
    shutdown.cancel();
}

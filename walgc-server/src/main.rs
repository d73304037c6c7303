//! walgc Server - periodic WAL collection with an HTTP status API

mod api;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use walgc_core::{Collaborators, DeploymentConfig, GarbageCollector, GcContext};

/// Write-ahead log garbage collector daemon
#[derive(Debug, Parser)]
#[command(name = "walgc", author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "WALGC_CONFIG")]
    config: Option<PathBuf>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Collector deployment
    #[serde(flatten)]
    pub deployment: DeploymentConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 50091)),
            deployment: DeploymentConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`, or use defaults
    fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.deployment.gc.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config = ServerConfig::load(args.config.as_deref())?;
    let deployment = &config.deployment;

    info!("Starting walgc server...");
    info!("WAL directories: {:?}", deployment.gc.wal_dirs);
    info!("Recovery directories: {:?}", deployment.gc.recovery_dirs);
    info!("HTTP server: http://{}", config.http_addr);

    let collaborators = Collaborators::local(&deployment.gc, &deployment.backends);
    let collector = GarbageCollector::new(
        deployment.gc.clone(),
        GcContext::new(deployment.credentials.clone()),
        collaborators,
    )?;
    let collector = Arc::new(collector);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let gc_task = {
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(Arc::clone(&collector).run(async move {
            let _ = shutdown_rx.changed().await;
        }))
    };

    // Create router
    let app = api::create_router(collector.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("walgc server listening on {}", config.http_addr);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    let mut http_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = http_shutdown.changed().await;
        })
        .await?;

    gc_task.await?;

    Ok(())
}

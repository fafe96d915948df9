//! xwd - multi-model inference daemon
//!
//! Scans the host for accelerators, reconciles instances that survived a
//! restart, and serves the OpenAI/Anthropic-compatible proxy plus the
//! management API.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use xw::backend::docker::DockerCli;
use xw::hooks::HookRunner;
use xw::inventory::DeviceInventory;
use xw::{ChipCatalog, Config, HealthMonitor, ModelCatalog};

#[derive(Parser, Debug)]
#[command(name = "xwd")]
#[command(about = "Multi-model inference daemon for AI accelerator pools")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/xw/config.json")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short, long)]
    address: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("xw=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting xwd");

    let mut config = if args.config.exists() {
        Config::from_file(&args.config).await?
    } else {
        warn!(path = %args.config.display(), "Config file not found, using defaults");
        Config::default()
    };
    if let Some(address) = args.address {
        config.address = address;
    }

    // Catalogs are fatal when unloadable; everything downstream keys off
    // them.
    let chips = Arc::new(
        ChipCatalog::load(&config.devices_catalog_path())
            .context("failed to load chip catalog")?,
    );
    let models = Arc::new(
        ModelCatalog::load(&config.models_catalog_path())
            .context("failed to load model catalog")?,
    );

    let inventory = Arc::new(DeviceInventory::scan(&chips).context("device scan failed")?);
    if inventory.is_empty() {
        warn!("No known accelerators found; instance scheduling will fail until devices appear in the catalog");
    }

    let metrics_handle = xw::telemetry::install();

    let container_backend = Arc::new(DockerCli::new());
    let hook_runner = Arc::new(HookRunner::new());
    let health = HealthMonitor::probe(std::time::Duration::from_secs(
        config.health_deadline_secs,
    ));

    let (app, _scheduler) = xw::build_app(
        &config,
        chips,
        models,
        inventory,
        container_backend,
        hook_runner,
        health,
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to build daemon: {}", e))?;

    // Metrics listener on its own port, if enabled.
    if let (Some(handle), true) = (metrics_handle, config.metrics_port > 0) {
        let metrics_addr = format!("127.0.0.1:{}", config.metrics_port);
        let listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("failed to bind metrics to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Serving metrics");
        let metrics_app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_app).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    xw::config::write_server_file(&config).context("failed to write server file")?;

    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("failed to bind to {}", config.address))?;
    info!(addr = %config.address, "Listening for requests");

    let shutdown_config = config.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("server error");

    xw::config::remove_server_file(&shutdown_config);
    result
}

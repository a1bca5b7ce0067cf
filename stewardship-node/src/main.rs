//! Stewardship Node
//!
//! Serves the graduated stewardship policy engine over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! stewardship-node
//!
//! # Start with custom config
//! stewardship-node --config /path/to/config.toml
//!
//! # Override the port and consensus threshold
//! stewardship-node --http-port 9000 --threshold 12
//! ```
//!
//! Command-line flags override values from the config file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use stewardship::{InMemoryRelationshipGraph, RuleBasedReviewer, StewardshipEngine, SystemClock};
use stewardship_node::{HttpServer, NodeConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stewardship-node")]
#[command(about = "Graduated stewardship policy engine")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "STEWARDSHIP_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(long, env = "STEWARDSHIP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "STEWARDSHIP_HTTP_PORT")]
    http_port: Option<u16>,

    /// Weighted support needed to open a consensus case
    #[arg(long, env = "STEWARDSHIP_THRESHOLD")]
    threshold: Option<f64>,

    /// Seconds between sweeps
    #[arg(long, env = "STEWARDSHIP_SWEEP_INTERVAL")]
    sweep_interval: Option<u64>,

    /// Identity recorded on reviewer decisions
    #[arg(long, env = "STEWARDSHIP_REVIEWER_ID")]
    reviewer_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("stewardship=info".parse()?)
                .add_directive("stewardship_node=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(threshold) = args.threshold {
        config.stewardship.trigger.threshold = threshold;
    }
    if let Some(secs) = args.sweep_interval {
        config.stewardship.sweep.interval_secs = secs;
    }
    if let Some(id) = args.reviewer_id {
        config.reviewer_id = id;
    }

    info!(
        data_dir = %config.data_dir.display(),
        http_port = config.http_port,
        threshold = config.stewardship.trigger.threshold,
        "Starting stewardship-node"
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let relationships = Arc::new(InMemoryRelationshipGraph::new());
    let reviewer = Arc::new(RuleBasedReviewer::new(
        config.reviewer_id.clone(),
        config.stewardship.reviewer.clone(),
    ));
    let engine = Arc::new(
        StewardshipEngine::open(
            config.store_path(),
            config.stewardship.clone(),
            Arc::new(SystemClock),
            relationships.clone(),
            reviewer,
        )
        .context("failed to open policy store")?,
    );

    let sweeper = engine.clone().spawn_sweeper();
    info!(
        interval_secs = config.stewardship.sweep.interval_secs,
        "Sweep running"
    );

    let http_addr: SocketAddr = format!("{}:{}", config.bind_host, config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(engine.clone(), relationships, http_addr));
    info!("HTTP API available at http://{}", http_addr);

    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    sweeper.abort();
    if let Err(e) = engine.store().flush() {
        error!(error = %e, "Failed to flush policy store");
    }

    Ok(())
}

//! modelgate - one OpenAI-compatible front door for local inference backends.

use anyhow::{Context, Result};
use clap::Parser;
use modelgate::GatewayConfig;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "modelgate")]
#[command(about = "OpenAI-compatible gateway for local inference backends")]
struct Args {
    /// Directory holding config.yaml, providers/, routes.yaml, models.yaml
    #[arg(short, long, default_value = ".")]
    config_dir: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Backend process output is logged under the "backend" target at debug
    // level, so it can be enabled with e.g. RUST_LOG=info,backend=debug.
    let filter = if args.verbose {
        EnvFilter::new("modelgate=debug,backend=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting modelgate");

    let mut config = GatewayConfig::load(&args.config_dir)
        .with_context(|| format!("failed to load config from {}", args.config_dir.display()))?;
    if let Some(port) = args.port {
        config.app.server.port = port;
    }

    info!(
        providers = config.providers.len(),
        routes = config.routes.len(),
        port = config.app.server.port,
        "Configuration loaded"
    );

    let metrics_handle = modelgate::telemetry::install();
    let metrics_port = config.app.metrics.port;
    let server = config.app.server.clone();

    let gateway = modelgate::build_app(config)
        .await
        .context("failed to build gateway")?;

    // Metrics listener, if enabled.
    if let (Some(handle), true) = (metrics_handle, metrics_port != 0) {
        let metrics_app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        let addr = format!("{}:{}", server.host, metrics_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind metrics to {addr}"))?;
        info!(addr = %addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_app).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, gateway.app)
        .await
        .context("server error")?;

    Ok(())
}

//! gRPC Relay - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use grpc_relay::grpc::server::start_grpc_server;
use grpc_relay::{
    ChannelConnector, ConnectionPool, Forwarder, PooledDirector, ProxyConfig, UrlRewriter, api,
    metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "grpc-relay")]
#[command(about = "Transparent gRPC proxy for configuration sidecars", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override gRPC listen port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting gRPC relay");

    // Load configuration
    let mut config = ProxyConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.grpc_addr.set_port(port);
    }

    config.validate()?;

    tracing::info!(
        grpc_addr = %config.grpc_addr,
        admin_addr = %config.admin_addr,
        backend = %config.backend.address,
        backend_tls = config.backend.tls.is_some(),
        max_active = config.pool.max_active,
        intercepted_method = %config.intercepted_method,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Backend pool
    let connector = ChannelConnector::new(&config)?;
    let pool = Arc::new(ConnectionPool::new(connector, config.pool.clone()));
    match pool.warm_up().await {
        Ok(dialed) => tracing::info!(connections = dialed, "Backend pool warmed up"),
        // Calls dial lazily, so an unreachable backend is not fatal here
        Err(e) => tracing::warn!(error = %e, "Backend pool warm-up failed"),
    }

    let rewriter = UrlRewriter::new(
        &config.external_scheme,
        &config.external_address,
        &config.download_prefix,
    )
    .context("Invalid external address for download URLs")?;
    let director = PooledDirector::new(pool.clone(), config.allowed_services.clone());
    let forwarder = Arc::new(Forwarder::new(
        director,
        rewriter,
        config.intercepted_method.clone(),
    ));

    // Both servers stop on the same signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let grpc_listener = tokio::net::TcpListener::bind(config.grpc_addr)
        .await
        .context("Failed to bind gRPC server")?;
    let grpc_handle = tokio::spawn({
        let config = config.clone();
        let shutdown = wait_for(shutdown_rx.clone());
        async move { start_grpc_server(grpc_listener, forwarder, &config, shutdown).await }
    });

    // Setup admin API
    let app_state = api::AppState {
        pool: pool.clone(),
        prometheus_handle,
    };
    let app = api::create_router(app_state);

    tracing::info!(addr = %config.admin_addr, "Starting admin API server");
    let admin_listener = tokio::net::TcpListener::bind(config.admin_addr)
        .await
        .context("Failed to bind admin API server")?;
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, app)
            .with_graceful_shutdown(wait_for(shutdown_rx))
            .await
    });

    shutdown_signal().await;
    tracing::info!("Shutting down...");
    shutdown_tx.send_replace(true);

    match tokio::time::timeout(config.shutdown_grace(), grpc_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "gRPC server failed"),
        Ok(Err(e)) => tracing::error!(error = %e, "gRPC server task panicked"),
        Err(_) => tracing::warn!(
            grace_secs = config.shutdown_grace_secs,
            "gRPC server did not drain within the grace period"
        ),
    }
    match admin_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Admin API server failed"),
        Err(e) => tracing::error!(error = %e, "Admin API server task panicked"),
    }

    // Close pooled backend connections
    if let Err(e) = pool.shutdown() {
        tracing::warn!(error = %e, "Backend pool shutdown failed");
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}

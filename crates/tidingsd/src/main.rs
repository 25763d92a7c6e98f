//! Tidings Server - clustered topic routing
//!
//! Usage:
//!   # Single node, in-memory store
//!   tidingsd
//!
//!   # Cluster member
//!   tidingsd --config cluster.yaml --cluster-self one
//!
//!   # Override the peer listener and expose Prometheus metrics
//!   tidingsd --config cluster.yaml --cluster-self two \
//!     --listen 0.0.0.0:12002 \
//!     --metrics-addr 0.0.0.0:9000

use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tidings_cluster::{init_metrics, ClusterHandler, TcpTransport, TransportConfig};
use tidingsd::{Cli, Node, ServerContext};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.load_config().context("loading configuration")?;
    let listen = cli.listen_addr(&config)?;
    init_metrics(config.metrics_addr);

    tracing::info!(
        node = %config.cluster.this_name,
        nodes = config.cluster.nodes.len(),
        store = %config.store.adapter,
        "Starting Tidings"
    );

    let ctx = ServerContext::from_config(config)?;
    let transport = Arc::new(TcpTransport::new(
        ctx.config.cluster.this_name.clone(),
        TransportConfig::default(),
    ));
    for peer in ctx.config.cluster.peers() {
        transport.add_peer(peer.name.clone(), peer.addr.clone());
    }

    let node = Node::new(ctx, transport.clone())?;
    let serve_shutdown = CancellationToken::new();
    if let Some(addr) = listen {
        let handler: Arc<dyn ClusterHandler> = node.clone();
        let bound = transport
            .serve(addr, handler, serve_shutdown.clone())
            .await
            .with_context(|| format!("binding cluster listener on {}", addr))?;
        tracing::info!(addr = %bound, "Cluster listener started");
    }
    node.start();

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, initiating graceful shutdown...");
    serve_shutdown.cancel();

    let shutdown_timeout = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, node.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timed out after {:?}, forcing exit", shutdown_timeout);
    }
    transport.shutdown();

    tracing::info!("Goodbye!");
    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

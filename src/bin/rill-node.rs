//! Rill node - standalone cluster coordinator process
//!
//! Runs a single self-elected coordinator that admits other nodes over the
//! cluster protocol until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rill::cluster::{serve, StaticFlowService, StaticLeaderReference};
use rill::{ClusterConfig, ClusterCoordinator, NodeIdentity, TcpTransport};

#[derive(Parser)]
#[command(
    name = "rill-node",
    version,
    about = "Rill cluster coordinator node",
    long_about = "Runs a self-elected cluster coordinator that tracks node connection \
                  status and admits nodes joining the cluster."
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address the cluster protocol listens on
    #[arg(long, default_value = "127.0.0.1:11443")]
    listen: SocketAddr,

    /// Identifier of this node, generated when omitted
    #[arg(long)]
    node_id: Option<String>,

    /// Host advertised for the node's API
    #[arg(long)]
    api_address: Option<String>,

    /// Port advertised for the node's API
    #[arg(long, default_value_t = 8080)]
    api_port: u16,

    /// File holding the flow handed to joining nodes
    #[arg(long)]
    flow: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(cli.debug))
        .init();

    let config = match &cli.config {
        Some(path) => ClusterConfig::from_file(path)?,
        None => ClusterConfig::default(),
    };

    let flow = match &cli.flow {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("failed to read flow from {}", path.display()))?,
        None => Vec::new(),
    };

    let host = cli.listen.ip().to_string();
    let node_id = cli
        .node_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let local = NodeIdentity::new(
        node_id,
        cli.api_address.clone().unwrap_or_else(|| host.clone()),
        cli.api_port,
        host,
        cli.listen.port(),
    );

    let transport = TcpTransport::new(config.request_timeout());
    let coordinator = ClusterCoordinator::builder(config, local.clone())
        .leader(Arc::new(StaticLeaderReference::self_elected(local.socket_endpoint())))
        .transport(Arc::new(transport))
        .flow_service(Arc::new(StaticFlowService::new(flow)))
        .build()?;
    coordinator.finish_node_connection(&local).await?;

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!(node = %local, listen = %cli.listen, "Rill node v{} started", rill::VERSION);

    let server = tokio::spawn(serve(listener, Arc::clone(&coordinator)));

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received; shutting down");
    coordinator.shutdown().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Cluster protocol listener failed"),
        Err(e) => error!(error = %e, "Cluster protocol listener panicked"),
    }

    let states = serde_json::to_string_pretty(&coordinator.statuses())?;
    info!("Final cluster membership:\n{}", states);
    Ok(())
}

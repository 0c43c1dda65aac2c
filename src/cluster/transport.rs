//! Protocol transport
//!
//! Outbound exchanges go through [`ClusterTransport`] so the coordinator can be
//! driven without sockets. [`TcpTransport`] opens one connection per exchange
//! and [`serve`] answers inbound exchanges with the local coordinator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::coordinator::ClusterCoordinator;
use super::messages::{
    ClusterMessage, ConnectionRequest, ConnectionResponse, DisconnectNotification,
    DisconnectionReport, MessageCodec, NodeStatusChangeNotification, ReconnectionRequest,
};
use crate::error::{ClusterError, ClusterResult};
use crate::types::{NodeConnectionStatus, NodeIdentity};

/// Outbound side of the cluster protocol
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Tell `target` that a node's status changed
    async fn notify_status_change(
        &self,
        target: &NodeIdentity,
        notification: &NodeStatusChangeNotification,
    ) -> ClusterResult<()>;

    /// Ask the node listening at `host:port` for its own status
    async fn request_node_status(&self, host: &str, port: u16) -> ClusterResult<NodeConnectionStatus>;

    /// Ask the node named in the request to rejoin
    async fn request_reconnection(&self, request: &ReconnectionRequest) -> ClusterResult<()>;

    /// Tell the node named in the notification that it was disconnected
    async fn disconnect(&self, notification: &DisconnectNotification) -> ClusterResult<()>;
}

/// TCP transport with one connection per exchange
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(&self, endpoint: &str, message: ClusterMessage) -> ClusterResult<ClusterMessage> {
        let exchange = async {
            let mut stream = TcpStream::connect(endpoint)
                .await
                .map_err(|e| ClusterError::Transport(format!("connect to {} failed: {}", endpoint, e)))?;
            MessageCodec::write_message(&mut stream, &message).await?;
            MessageCodec::read_message(&mut stream).await
        };
        tokio::time::timeout(self.timeout, exchange).await?
    }

    /// Ask the coordinator at `endpoint` to let this node join
    pub async fn request_connection(
        &self,
        endpoint: &str,
        request: ConnectionRequest,
    ) -> ClusterResult<ConnectionResponse> {
        match self.exchange(endpoint, ClusterMessage::ConnectionRequest(request)).await? {
            ClusterMessage::ConnectionResponse(response) => Ok(response),
            ClusterMessage::Failure { explanation } => Err(ClusterError::Rejected(explanation)),
            other => Err(ClusterError::Codec(format!(
                "expected connection-response, got {}",
                other.kind()
            ))),
        }
    }

    /// Tell the coordinator at `endpoint` that this node is leaving
    pub async fn report_disconnection(
        &self,
        endpoint: &str,
        report: DisconnectionReport,
    ) -> ClusterResult<()> {
        self.exchange(endpoint, ClusterMessage::DisconnectionReport(report))
            .await?
            .into_ack()
    }
}

#[async_trait]
impl ClusterTransport for TcpTransport {
    async fn notify_status_change(
        &self,
        target: &NodeIdentity,
        notification: &NodeStatusChangeNotification,
    ) -> ClusterResult<()> {
        self.exchange(
            &target.socket_endpoint(),
            ClusterMessage::NodeStatusChange(notification.clone()),
        )
        .await?
        .into_ack()
    }

    async fn request_node_status(&self, host: &str, port: u16) -> ClusterResult<NodeConnectionStatus> {
        let endpoint = format!("{}:{}", host, port);
        match self.exchange(&endpoint, ClusterMessage::NodeStatusRequest).await? {
            ClusterMessage::NodeStatusResponse(status) => Ok(status),
            ClusterMessage::Failure { explanation } => Err(ClusterError::Rejected(explanation)),
            other => Err(ClusterError::Codec(format!(
                "expected node-status-response, got {}",
                other.kind()
            ))),
        }
    }

    async fn request_reconnection(&self, request: &ReconnectionRequest) -> ClusterResult<()> {
        self.exchange(
            &request.node_id.socket_endpoint(),
            ClusterMessage::Reconnection(request.clone()),
        )
        .await?
        .into_ack()
    }

    async fn disconnect(&self, notification: &DisconnectNotification) -> ClusterResult<()> {
        self.exchange(
            &notification.node_id.socket_endpoint(),
            ClusterMessage::Disconnect(notification.clone()),
        )
        .await?
        .into_ack()
    }
}

/// Answer protocol exchanges until the coordinator shuts down
pub async fn serve(listener: TcpListener, coordinator: Arc<ClusterCoordinator>) -> ClusterResult<()> {
    let shutdown = coordinator.shutdown_signal().clone();
    info!(address = ?listener.local_addr().ok(), "Cluster protocol listener started");

    loop {
        tokio::select! {
            _ = shutdown.triggered() => {
                info!("Cluster protocol listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let coordinator = Arc::clone(&coordinator);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        match shutdown.interruptible(answer(stream, coordinator)).await {
                            Some(Err(e)) => debug!(%peer, error = %e, "Protocol exchange failed"),
                            Some(Ok(())) => {}
                            None => debug!(%peer, "Protocol exchange dropped at shutdown"),
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept protocol connection"),
            }
        }
    }
}

async fn answer(mut stream: TcpStream, coordinator: Arc<ClusterCoordinator>) -> ClusterResult<()> {
    let request = coordinator
        .with_timeout(MessageCodec::read_message(&mut stream))
        .await?;
    debug!(kind = request.kind(), "Received protocol message");
    let reply = coordinator.handle_message(request).await;
    coordinator
        .with_timeout(MessageCodec::write_message(&mut stream, &reply))
        .await
}

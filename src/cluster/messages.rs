//! Cluster protocol messages and their wire encoding
//!
//! Every exchange is one request frame followed by one reply frame. A frame
//! is a 4-byte big-endian length followed by the bincode-encoded message.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ClusterError, ClusterResult};
use crate::types::{ComponentRevision, DisconnectReasonCode, NodeConnectionStatus, NodeIdentity};

/// Largest frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A node asking to join the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub proposed_identity: NodeIdentity,
    pub requester_identity: Option<String>,
}

/// Everything a node needs to join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub resolved_identity: NodeIdentity,
    pub flow: Vec<u8>,
    pub cluster_instance_id: String,
    pub statuses: Vec<NodeConnectionStatus>,
    pub revisions: Vec<ComponentRevision>,
}

/// Answer to a [`ConnectionRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionResponse {
    BlockedByFirewall,
    TryAgain { seconds: u32 },
    Accepted(Box<ClusterSnapshot>),
}

impl ConnectionResponse {
    pub fn snapshot(&self) -> Option<&ClusterSnapshot> {
        match self {
            ConnectionResponse::Accepted(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Fire-and-forget notice that a node's status changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusChangeNotification {
    /// Node whose status changed
    pub node_id: String,
    pub status: NodeConnectionStatus,
    /// Node that sent this notification, excluded from re-broadcast
    pub origin: Option<String>,
}

/// Coordinator asking a node to rejoin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionRequest {
    pub node_id: NodeIdentity,
    pub instance_id: String,
    pub flow: Vec<u8>,
    pub statuses: Vec<NodeConnectionStatus>,
    pub revisions: Vec<ComponentRevision>,
}

/// Coordinator telling a node it has been disconnected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectNotification {
    pub node_id: NodeIdentity,
    pub explanation: String,
}

/// A node announcing that it is leaving the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectionReport {
    pub node_id: NodeIdentity,
    pub code: DisconnectReasonCode,
    pub explanation: Option<String>,
}

/// Every message exchanged between coordinators and nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterMessage {
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    NodeStatusChange(NodeStatusChangeNotification),
    NodeStatusRequest,
    NodeStatusResponse(NodeConnectionStatus),
    Reconnection(ReconnectionRequest),
    Disconnect(DisconnectNotification),
    DisconnectionReport(DisconnectionReport),
    Ack,
    Failure { explanation: String },
}

impl ClusterMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::ConnectionRequest(_) => "connection-request",
            ClusterMessage::ConnectionResponse(_) => "connection-response",
            ClusterMessage::NodeStatusChange(_) => "node-status-change",
            ClusterMessage::NodeStatusRequest => "node-status-request",
            ClusterMessage::NodeStatusResponse(_) => "node-status-response",
            ClusterMessage::Reconnection(_) => "reconnection-request",
            ClusterMessage::Disconnect(_) => "disconnect",
            ClusterMessage::DisconnectionReport(_) => "disconnection-report",
            ClusterMessage::Ack => "ack",
            ClusterMessage::Failure { .. } => "failure",
        }
    }

    /// Turn a reply that should be `Ack` into a result
    pub fn into_ack(self) -> ClusterResult<()> {
        match self {
            ClusterMessage::Ack => Ok(()),
            ClusterMessage::Failure { explanation } => Err(ClusterError::Rejected(explanation)),
            other => Err(ClusterError::Codec(format!("expected ack, got {}", other.kind()))),
        }
    }
}

/// Length-prefixed bincode framing
pub struct MessageCodec;

impl MessageCodec {
    /// Encode a message into a complete frame
    pub fn encode(message: &ClusterMessage) -> ClusterResult<BytesMut> {
        let body = bincode::serialize(message)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(ClusterError::Codec(format!(
                "message of {} bytes exceeds frame limit",
                body.len()
            )));
        }
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame)
    }

    /// Decode a frame body (without the length prefix)
    pub fn decode(body: &[u8]) -> ClusterResult<ClusterMessage> {
        Ok(bincode::deserialize(body)?)
    }

    pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> ClusterResult<ClusterMessage> {
        let mut length_bytes = [0u8; 4];
        reader.read_exact(&mut length_bytes).await?;
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ClusterError::Codec(format!(
                "frame of {} bytes exceeds limit",
                length
            )));
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        Self::decode(&body)
    }

    pub async fn write_message<W: AsyncWriteExt + Unpin>(
        writer: &mut W,
        message: &ClusterMessage,
    ) -> ClusterResult<()> {
        let frame = Self::encode(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

//! Core types shared by the coordinator
//!
//! Node identities, connection states and the status records that are
//! exchanged between nodes and kept in the connection status store.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and addressing of a cluster node
///
/// Equality and hashing use the opaque `id` only. Two identities whose
/// addressing matches but whose ids differ are [`logically_equal`] without
/// being equal.
///
/// [`logically_equal`]: NodeIdentity::logically_equal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    id: String,
    api_address: String,
    api_port: u16,
    socket_address: String,
    socket_port: u16,
    transfer_address: Option<String>,
    transfer_port: Option<u16>,
    requester_identity: Option<String>,
}

impl NodeIdentity {
    pub fn new(
        id: impl Into<String>,
        api_address: impl Into<String>,
        api_port: u16,
        socket_address: impl Into<String>,
        socket_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            api_address: api_address.into(),
            api_port,
            socket_address: socket_address.into(),
            socket_port,
            transfer_address: None,
            transfer_port: None,
            requester_identity: None,
        }
    }

    /// Same addressing with a freshly generated id
    pub fn regenerate(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    pub fn with_transfer_address(mut self, address: impl Into<String>, port: u16) -> Self {
        self.transfer_address = Some(address.into());
        self.transfer_port = Some(port);
        self
    }

    pub fn with_requester_identity(mut self, requester: Option<String>) -> Self {
        self.requester_identity = requester;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn api_address(&self) -> &str {
        &self.api_address
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn socket_address(&self) -> &str {
        &self.socket_address
    }

    pub fn socket_port(&self) -> u16 {
        self.socket_port
    }

    pub fn transfer_address(&self) -> Option<&str> {
        self.transfer_address.as_deref()
    }

    pub fn transfer_port(&self) -> Option<u16> {
        self.transfer_port
    }

    pub fn requester_identity(&self) -> Option<&str> {
        self.requester_identity.as_deref()
    }

    /// `host:port` of the internal protocol endpoint
    pub fn socket_endpoint(&self) -> String {
        format!("{}:{}", self.socket_address, self.socket_port)
    }

    /// True when every addressing field matches, regardless of id
    pub fn logically_equal(&self, other: &NodeIdentity) -> bool {
        self.api_address == other.api_address
            && self.api_port == other.api_port
            && self.socket_address == other.socket_address
            && self.socket_port == other.socket_port
            && self.transfer_address == other.transfer_address
            && self.transfer_port == other.transfer_port
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.api_address, self.api_port)
    }
}

/// Connection state of a node as seen by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeConnectionState {
    NotYetConnected,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Never stored. Applying it deletes the node's entry.
    Removed,
}

impl fmt::Display for NodeConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeConnectionState::NotYetConnected => write!(f, "NOT_YET_CONNECTED"),
            NodeConnectionState::Connecting => write!(f, "CONNECTING"),
            NodeConnectionState::Connected => write!(f, "CONNECTED"),
            NodeConnectionState::Disconnecting => write!(f, "DISCONNECTING"),
            NodeConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            NodeConnectionState::Removed => write!(f, "REMOVED"),
        }
    }
}

/// Why a node is (or is being) disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReasonCode {
    NotYetConnected,
    NodeShutdown,
    UnableToCommunicate,
    LackOfHeartbeat,
    MismatchedFlows,
    StartupFailure,
    FailedToServiceRequest,
    Unknown,
    UserDisconnected,
}

impl DisconnectReasonCode {
    /// Severity used when a node reports a disconnection for this reason
    pub fn severity(self) -> Severity {
        match self {
            DisconnectReasonCode::StartupFailure
            | DisconnectReasonCode::MismatchedFlows
            | DisconnectReasonCode::Unknown => Severity::Error,
            DisconnectReasonCode::LackOfHeartbeat => Severity::Warning,
            DisconnectReasonCode::NotYetConnected
            | DisconnectReasonCode::NodeShutdown
            | DisconnectReasonCode::UnableToCommunicate
            | DisconnectReasonCode::FailedToServiceRequest
            | DisconnectReasonCode::UserDisconnected => Severity::Info,
        }
    }
}

impl fmt::Display for DisconnectReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReasonCode::NotYetConnected => "Has Not Yet Connected to Cluster",
            DisconnectReasonCode::NodeShutdown => "Node Was Shut Down",
            DisconnectReasonCode::UnableToCommunicate => "Unable to Communicate with Node",
            DisconnectReasonCode::LackOfHeartbeat => "Lack of Heartbeat",
            DisconnectReasonCode::MismatchedFlows => "Node's Flow did not Match Cluster Flow",
            DisconnectReasonCode::StartupFailure => "Node Failed to Startup Properly",
            DisconnectReasonCode::FailedToServiceRequest => "Failed to Service Request",
            DisconnectReasonCode::Unknown => "Unknown Reason",
            DisconnectReasonCode::UserDisconnected => "User Disconnected Node",
        };
        f.write_str(text)
    }
}

/// Severity of a node event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// A node's connection status at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnectionStatus {
    pub identity: NodeIdentity,
    pub state: NodeConnectionState,
    pub disconnect_code: Option<DisconnectReasonCode>,
    pub reason: Option<String>,
    /// Fencing token minted by the node that produced this status
    pub update_id: u64,
    pub timestamp: DateTime<Utc>,
}

impl NodeConnectionStatus {
    pub fn new(identity: NodeIdentity, state: NodeConnectionState, update_id: u64) -> Self {
        Self {
            identity,
            state,
            disconnect_code: None,
            reason: None,
            update_id,
            timestamp: Utc::now(),
        }
    }

    /// A DISCONNECTED status carrying its reason
    pub fn disconnected(
        identity: NodeIdentity,
        code: DisconnectReasonCode,
        reason: Option<String>,
        update_id: u64,
    ) -> Self {
        Self {
            identity,
            state: NodeConnectionState::Disconnected,
            disconnect_code: Some(code),
            reason,
            update_id,
            timestamp: Utc::now(),
        }
    }

    pub fn node_id(&self) -> &str {
        self.identity.id()
    }
}

impl fmt::Display for NodeConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}", self.identity, self.state)?;
        if let Some(code) = self.disconnect_code {
            write!(f, ", code={:?}", code)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ", reason={}", reason)?;
        }
        write!(f, ", updateId={}]", self.update_id)
    }
}

/// Revision of a flow component, shipped to nodes joining the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRevision {
    pub component_id: String,
    pub version: u64,
    pub client_id: Option<String>,
}

/// One node's answer to a replicated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResponse {
    pub node: NodeIdentity,
    pub status: u16,
}

impl NodeResponse {
    pub fn new(node: NodeIdentity, status: u16) -> Self {
        Self { node, status }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn identity(id: &str, port: u16) -> NodeIdentity {
        NodeIdentity::new(id, "node-a", 8080, "node-a", port)
    }

    #[test]
    fn test_identity_equality_uses_id() {
        let a = identity("n1", 9000);
        let b = identity("n1", 9001);
        assert_eq!(a, b);
        assert!(!a.logically_equal(&b));

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_regenerate_keeps_addressing() {
        let a = identity("n1", 9000).with_transfer_address("node-a", 7000);
        let b = a.regenerate();
        assert_ne!(a, b);
        assert!(a.logically_equal(&b));
        assert_eq!(b.transfer_port(), Some(7000));
    }

    #[test]
    fn test_reason_severity_mapping() {
        assert_eq!(DisconnectReasonCode::StartupFailure.severity(), Severity::Error);
        assert_eq!(DisconnectReasonCode::MismatchedFlows.severity(), Severity::Error);
        assert_eq!(DisconnectReasonCode::Unknown.severity(), Severity::Error);
        assert_eq!(DisconnectReasonCode::LackOfHeartbeat.severity(), Severity::Warning);
        assert_eq!(DisconnectReasonCode::NodeShutdown.severity(), Severity::Info);
        assert_eq!(DisconnectReasonCode::UserDisconnected.severity(), Severity::Info);
    }

    #[test]
    fn test_disconnected_status() {
        let status = NodeConnectionStatus::disconnected(
            identity("n1", 9000),
            DisconnectReasonCode::LackOfHeartbeat,
            None,
            4,
        );
        assert_eq!(status.state, NodeConnectionState::Disconnected);
        assert_eq!(status.node_id(), "n1");
        assert!(status.to_string().contains("updateId=4"));
    }
}

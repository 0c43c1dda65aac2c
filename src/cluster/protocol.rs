//! Inbound protocol handling
//!
//! Connection requests, status-change notifications and status requests
//! arriving from other nodes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::coordinator::{describe_status_change, ClusterCoordinator};
use super::messages::{
    ClusterMessage, ClusterSnapshot, ConnectionRequest, ConnectionResponse,
    NodeStatusChangeNotification,
};
use crate::types::{
    DisconnectReasonCode, NodeConnectionState, NodeConnectionStatus, NodeIdentity, Severity,
};

/// How a proposed identity was resolved against known nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityResolution {
    /// Nobody used the id; it is now reserved
    New(NodeIdentity),
    /// The id belongs to the same node, rejoining
    Existing(NodeIdentity),
    /// The id belongs to a different node; a fresh id was assigned
    Collision {
        existing: NodeIdentity,
        resolved: NodeIdentity,
    },
}

impl IdentityResolution {
    pub fn identity(&self) -> &NodeIdentity {
        match self {
            IdentityResolution::New(identity) | IdentityResolution::Existing(identity) => identity,
            IdentityResolution::Collision { resolved, .. } => resolved,
        }
    }

    pub fn into_identity(self) -> NodeIdentity {
        match self {
            IdentityResolution::New(identity) | IdentityResolution::Existing(identity) => identity,
            IdentityResolution::Collision { resolved, .. } => resolved,
        }
    }
}

impl ClusterCoordinator {
    /// Dispatch one inbound protocol message and produce the reply
    pub async fn handle_message(self: &Arc<Self>, message: ClusterMessage) -> ClusterMessage {
        match message {
            ClusterMessage::ConnectionRequest(request) => {
                ClusterMessage::ConnectionResponse(self.handle_connection_request(request).await)
            }
            ClusterMessage::NodeStatusChange(notification) => {
                self.handle_status_change(notification).await;
                ClusterMessage::Ack
            }
            ClusterMessage::NodeStatusRequest => match self.handle_status_request() {
                Some(status) => ClusterMessage::NodeStatusResponse(status),
                None => ClusterMessage::Failure {
                    explanation: "local node status is unknown".to_string(),
                },
            },
            ClusterMessage::DisconnectionReport(report) => {
                self.disconnection_requested_by_node(&report.node_id, report.code, report.explanation)
                    .await;
                ClusterMessage::Ack
            }
            ClusterMessage::Reconnection(_) | ClusterMessage::Disconnect(_) => ClusterMessage::Failure {
                explanation: "reconnection and disconnection requests are handled by the node's flow controller"
                    .to_string(),
            },
            other => ClusterMessage::Failure {
                explanation: format!("unexpected {} message", other.kind()),
            },
        }
    }

    /// Pick the identity a connecting node will use
    ///
    /// An unknown id is reserved with a NOT_YET_CONNECTED placeholder. A known
    /// id is kept when the addressing matches; otherwise the proposal is
    /// given a freshly generated id.
    pub fn resolve_identity(&self, proposed: &NodeIdentity) -> IdentityResolution {
        let placeholder = NodeConnectionStatus {
            disconnect_code: Some(DisconnectReasonCode::NotYetConnected),
            ..self.new_status(proposed.clone(), NodeConnectionState::NotYetConnected)
        };
        match self.store().insert_if_absent(placeholder) {
            None => IdentityResolution::New(proposed.clone()),
            Some(existing) if existing.identity.logically_equal(proposed) => {
                IdentityResolution::Existing(proposed.clone())
            }
            Some(existing) => {
                let resolved = proposed.regenerate();
                warn!(
                    proposed = %proposed,
                    existing = %existing.identity,
                    assigned = resolved.id(),
                    "Node identifier already in use by a different node; assigning a new identifier"
                );
                self.report_event(
                    resolved.id(),
                    Severity::Warning,
                    format!(
                        "Node {} proposed identifier {} which is already used by {}; assigned identifier {}",
                        proposed,
                        proposed.id(),
                        existing.identity,
                        resolved.id()
                    ),
                );
                IdentityResolution::Collision {
                    existing: existing.identity,
                    resolved,
                }
            }
        }
    }

    /// Admit a node into the cluster
    pub async fn handle_connection_request(&self, request: ConnectionRequest) -> ConnectionResponse {
        let proposed = request
            .proposed_identity
            .with_requester_identity(request.requester_identity);

        if !self.firewall().is_permissible(proposed.socket_address()) {
            info!(node = %proposed, "Firewall blocked connection request");
            self.event_sink().report(
                Some(proposed.id()),
                Severity::Warning,
                &format!("Firewall blocked connection request from {}", proposed.socket_address()),
            );
            return ConnectionResponse::BlockedByFirewall;
        }

        let resolution = self.resolve_identity(&proposed);
        let message = match resolution {
            IdentityResolution::Existing(_) => {
                "Connection requested from existing node. Setting status to connecting."
            }
            _ => "Connection requested from new node. Setting status to connecting.",
        };
        let resolved = resolution.into_identity();
        self.store().add_event(resolved.id(), Severity::Info, message);

        let status = self.new_status(resolved.clone(), NodeConnectionState::Connecting);
        self.update_node_status(status, true).await;

        let flow = match self.flow_service().current_flow().await {
            Ok(flow) => flow,
            Err(e) => {
                let seconds = self.config().try_again_seconds;
                warn!(node = %resolved, error = %e, "Unable to obtain current flow for connecting node");
                self.store().add_event(
                    resolved.id(),
                    Severity::Warning,
                    format!(
                        "Connection requested from node, but unable to obtain current flow. Instructing node to try again in {} seconds.",
                        seconds
                    ),
                );
                return ConnectionResponse::TryAgain { seconds };
            }
        };

        ConnectionResponse::Accepted(Box::new(ClusterSnapshot {
            resolved_identity: resolved,
            flow,
            cluster_instance_id: self.instance_id().to_string(),
            statuses: self.store().all(),
            revisions: self.revision_source().all_revisions(),
        }))
    }

    /// Apply a status change announced by another node
    ///
    /// The elected coordinator re-broadcasts the notification to every other
    /// live node except the sender. Returns how many nodes received it.
    pub async fn handle_status_change(&self, notification: NodeStatusChangeNotification) -> usize {
        let status = notification.status.clone();
        let node_id = status.node_id().to_string();
        let previous = self.store().get(&node_id);

        if status.state == NodeConnectionState::Removed {
            if !self.store().replace(&node_id, previous.as_ref(), status.clone()) {
                debug!(node = %status.identity, "Node status changed concurrently; removal not applied");
            }
        } else {
            self.store().put(status.clone());
            if previous.as_ref().map(|p| p.state) != Some(status.state) {
                self.store().add_event(
                    &node_id,
                    Severity::Info,
                    describe_status_change(previous.as_ref(), &status),
                );
            }
        }
        self.store().observe_update_id(status.update_id);
        info!(
            node = %status.identity,
            from = ?previous.as_ref().map(|p| p.state),
            to = %status.state,
            origin = notification.origin.as_deref().unwrap_or("-"),
            "Received status change"
        );

        if !self.is_active_coordinator() {
            return 0;
        }
        let local = self.local_identity().clone();
        let targets: Vec<NodeIdentity> = self
            .store()
            .identities(&[NodeConnectionState::Connected, NodeConnectionState::Connecting])
            .into_iter()
            .filter(|node| node != &local)
            .filter(|node| notification.origin.as_deref() != Some(node.id()))
            .collect();
        if targets.is_empty() {
            return 0;
        }
        self.send_notifications(targets, &notification).await
    }

    /// This node's own status
    pub fn handle_status_request(&self) -> Option<NodeConnectionStatus> {
        self.store().get(self.local_identity().id())
    }
}

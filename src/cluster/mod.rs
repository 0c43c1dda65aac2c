//! Cluster membership
//!
//! Tracks the connection status of every node, admits joining nodes,
//! propagates status changes, and drives the reconnection and disconnection
//! workflows.

pub mod collaborators;
pub mod coordinator;
pub mod events;
pub mod leader;
pub mod messages;
pub mod protocol;
pub mod replication;
pub mod store;
pub mod transport;
pub mod workflow;

// Re-export the coordinator and its seams
pub use coordinator::{ClusterCoordinator, CoordinatorBuilder};
pub use protocol::IdentityResolution;
pub use replication::ReplicationVerdict;
pub use workflow::{ShutdownSignal, WorkflowOutcome, WorkflowPool};

pub use collaborators::{
    AllowListFirewall, EventSink, Firewall, FlowService, PermitAllFirewall, ResponseClassifier,
    RevisionSource, StaticFlowService, StaticRevisionSource, StatusCodeClassifier, TracingEventSink,
};
pub use events::{NodeEvent, NodeEventLog};
pub use leader::{ElectableRole, LeaderReference, StaticLeaderReference};
pub use messages::{
    ClusterMessage, ClusterSnapshot, ConnectionRequest, ConnectionResponse, DisconnectNotification,
    DisconnectionReport, MessageCodec, NodeStatusChangeNotification, ReconnectionRequest,
};
pub use store::{ConnectionStatusStore, UpdateIdGenerator};
pub use transport::{serve, ClusterTransport, TcpTransport};

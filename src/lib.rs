//! # Rill: cluster membership coordination
//!
//! Tracks which nodes belong to a cluster and in what connection state,
//! admits joining nodes, propagates status changes through the elected
//! coordinator, and drives reconnection and disconnection of nodes.
//!
//! The leader-election service, the flow synchronizer and the firewall are
//! supplied by the embedding process through the traits in
//! [`cluster::collaborators`] and [`cluster::leader`].

#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod types;

// Re-export main types
pub use cluster::{ClusterCoordinator, ClusterTransport, ConnectionStatusStore, TcpTransport};
pub use config::ClusterConfig;
pub use error::{ClusterError, ClusterResult};
pub use types::{
    ComponentRevision, DisconnectReasonCode, NodeConnectionState, NodeConnectionStatus,
    NodeIdentity, NodeResponse, Severity,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for the cluster coordinator

use thiserror::Error;

/// Result type for coordinator operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Main error type for coordinator operations
#[derive(Error, Debug)]
pub enum ClusterError {
    /// No node currently holds the requested role
    #[error("No leader is currently elected for role {0}")]
    NoLeader(String),

    /// The leader-election service reported an address we cannot use
    #[error("Invalid leader address: {0}")]
    InvalidLeaderAddress(String),

    /// Failure while talking to a peer
    #[error("Transport error: {0}")]
    Transport(String),

    /// Wire encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The flow service could not produce the current flow
    #[error("Flow unavailable: {0}")]
    FlowUnavailable(String),

    /// Disconnecting the node would leave the cluster without a connected node
    #[error("Illegal disconnection: {0}")]
    IllegalDisconnection(String),

    /// Node is not known to this coordinator
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An outbound exchange did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The process is shutting down
    #[error("Coordinator is shutting down")]
    ShuttingDown,

    /// A peer answered with an explicit failure
    #[error("Request rejected by peer: {0}")]
    Rejected(String),
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Codec(err.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(err: toml::de::Error) -> Self {
        ClusterError::Configuration(err.to_string())
    }
}

impl ClusterError {
    /// Whether the failure is worth retrying on the next workflow attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Transport(_)
                | ClusterError::Io(_)
                | ClusterError::Timeout(_)
                | ClusterError::FlowUnavailable(_)
                | ClusterError::Rejected(_)
                | ClusterError::NoLeader(_)
        )
    }
}

//! Collaborators consumed by the coordinator
//!
//! The flow synchronizer, firewall, revision manager, response merger and
//! event reporting live outside this crate. The coordinator only sees the
//! narrow traits below. Simple implementations are provided for single-node
//! deployments and tests.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::types::{ComponentRevision, NodeResponse, Severity};

/// Decides whether a host may join the cluster
pub trait Firewall: Send + Sync {
    fn is_permissible(&self, hostname: &str) -> bool;
}

/// Source of the current flow definition
#[async_trait]
pub trait FlowService: Send + Sync {
    /// False until the service can serve flows
    fn is_initialized(&self) -> bool;

    /// Serialized current flow
    async fn current_flow(&self) -> ClusterResult<Vec<u8>>;
}

/// Source of component revisions
pub trait RevisionSource: Send + Sync {
    fn all_revisions(&self) -> Vec<ComponentRevision>;
}

/// Picks the responses that indicate a node failed to service a request
pub trait ResponseClassifier: Send + Sync {
    fn problematic_responses(&self, responses: &[NodeResponse]) -> Vec<NodeResponse>;
}

/// Receives events that must be surfaced outside the coordinator
pub trait EventSink: Send + Sync {
    fn report(&self, node_id: Option<&str>, severity: Severity, message: &str);
}

/// Firewall that admits everyone
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAllFirewall;

impl Firewall for PermitAllFirewall {
    fn is_permissible(&self, _hostname: &str) -> bool {
        true
    }
}

/// Firewall admitting only listed hostnames
#[derive(Debug, Default)]
pub struct AllowListFirewall {
    allowed: RwLock<HashSet<String>>,
}

impl AllowListFirewall {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: RwLock::new(hosts.into_iter().map(|h| h.into().to_lowercase()).collect()),
        }
    }

    pub fn allow(&self, host: impl Into<String>) {
        self.allowed.write().insert(host.into().to_lowercase());
    }
}

impl Firewall for AllowListFirewall {
    fn is_permissible(&self, hostname: &str) -> bool {
        self.allowed.read().contains(&hostname.to_lowercase())
    }
}

/// Flow service serving an in-memory flow
#[derive(Debug, Default)]
pub struct StaticFlowService {
    flow: RwLock<Option<Vec<u8>>>,
}

impl StaticFlowService {
    /// An initialized service serving `flow`
    pub fn new(flow: Vec<u8>) -> Self {
        Self {
            flow: RwLock::new(Some(flow)),
        }
    }

    /// A service that has not loaded a flow yet
    pub fn uninitialized() -> Self {
        Self::default()
    }

    pub fn set_flow(&self, flow: Option<Vec<u8>>) {
        *self.flow.write() = flow;
    }
}

#[async_trait]
impl FlowService for StaticFlowService {
    fn is_initialized(&self) -> bool {
        self.flow.read().is_some()
    }

    async fn current_flow(&self) -> ClusterResult<Vec<u8>> {
        self.flow
            .read()
            .clone()
            .ok_or_else(|| ClusterError::FlowUnavailable("flow has not been loaded".to_string()))
    }
}

/// Revision source with a fixed set of revisions
#[derive(Debug, Default)]
pub struct StaticRevisionSource {
    revisions: RwLock<Vec<ComponentRevision>>,
}

impl StaticRevisionSource {
    pub fn new(revisions: Vec<ComponentRevision>) -> Self {
        Self {
            revisions: RwLock::new(revisions),
        }
    }

    pub fn set_revisions(&self, revisions: Vec<ComponentRevision>) {
        *self.revisions.write() = revisions;
    }
}

impl RevisionSource for StaticRevisionSource {
    fn all_revisions(&self) -> Vec<ComponentRevision> {
        self.revisions.read().clone()
    }
}

/// Classifies by HTTP status code
///
/// Every non-2xx response is problematic, including when no node succeeded.
/// Telling a cluster-wide failure apart is left to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusCodeClassifier;

impl ResponseClassifier for StatusCodeClassifier {
    fn problematic_responses(&self, responses: &[NodeResponse]) -> Vec<NodeResponse> {
        responses.iter().filter(|r| !r.is_success()).cloned().collect()
    }
}

/// Event sink writing to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn report(&self, node_id: Option<&str>, severity: Severity, message: &str) {
        let node = node_id.unwrap_or("-");
        match severity {
            Severity::Info => info!(node, "{}", message),
            Severity::Warning => warn!(node, "{}", message),
            Severity::Error => error!(node, "{}", message),
        }
    }
}

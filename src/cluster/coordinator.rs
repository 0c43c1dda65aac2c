//! Cluster coordinator
//!
//! Owns the connection status store and decides who hears about a status
//! change. The elected coordinator fans changes out to every CONNECTED or
//! CONNECTING node; every other node only tells the coordinator, which
//! re-broadcasts (hub-and-spoke).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::collaborators::{
    EventSink, Firewall, FlowService, PermitAllFirewall, ResponseClassifier, RevisionSource,
    StaticRevisionSource, StatusCodeClassifier, TracingEventSink,
};
use super::events::NodeEvent;
use super::leader::{parse_leader_address, ElectableRole, LeaderReference};
use super::messages::NodeStatusChangeNotification;
use super::store::ConnectionStatusStore;
use super::transport::ClusterTransport;
use super::workflow::{ShutdownSignal, WorkflowPool};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::types::{
    DisconnectReasonCode, NodeConnectionState, NodeConnectionStatus, NodeIdentity, Severity,
};

/// States that receive status-change fan-out
const LIVE_STATES: [NodeConnectionState; 2] =
    [NodeConnectionState::Connected, NodeConnectionState::Connecting];

/// Membership coordinator for one node of the cluster
pub struct ClusterCoordinator {
    config: ClusterConfig,
    instance_id: String,
    local: NodeIdentity,
    store: Arc<ConnectionStatusStore>,
    leader: Arc<dyn LeaderReference>,
    transport: Arc<dyn ClusterTransport>,
    firewall: Arc<dyn Firewall>,
    flow_service: Arc<dyn FlowService>,
    revisions: Arc<dyn RevisionSource>,
    classifier: Arc<dyn ResponseClassifier>,
    event_sink: Arc<dyn EventSink>,
    shutdown: ShutdownSignal,
    workflows: WorkflowPool,
}

/// Builder for [`ClusterCoordinator`]
///
/// The leader reference, transport and flow service are required. Everything
/// else falls back to a permissive default.
pub struct CoordinatorBuilder {
    config: ClusterConfig,
    local: NodeIdentity,
    store: Option<Arc<ConnectionStatusStore>>,
    leader: Option<Arc<dyn LeaderReference>>,
    transport: Option<Arc<dyn ClusterTransport>>,
    firewall: Arc<dyn Firewall>,
    flow_service: Option<Arc<dyn FlowService>>,
    revisions: Arc<dyn RevisionSource>,
    classifier: Arc<dyn ResponseClassifier>,
    event_sink: Arc<dyn EventSink>,
}

impl CoordinatorBuilder {
    pub fn store(mut self, store: Arc<ConnectionStatusStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn leader(mut self, leader: Arc<dyn LeaderReference>) -> Self {
        self.leader = Some(leader);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = firewall;
        self
    }

    pub fn flow_service(mut self, flow_service: Arc<dyn FlowService>) -> Self {
        self.flow_service = Some(flow_service);
        self
    }

    pub fn revisions(mut self, revisions: Arc<dyn RevisionSource>) -> Self {
        self.revisions = revisions;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ResponseClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn event_sink(mut self, event_sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = event_sink;
        self
    }

    /// Validate the configuration and seed the local node as NOT_YET_CONNECTED
    pub fn build(self) -> ClusterResult<Arc<ClusterCoordinator>> {
        self.config.validate()?;
        let leader = self
            .leader
            .ok_or_else(|| ClusterError::Configuration("a leader reference is required".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| ClusterError::Configuration("a transport is required".to_string()))?;
        let flow_service = self
            .flow_service
            .ok_or_else(|| ClusterError::Configuration("a flow service is required".to_string()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(ConnectionStatusStore::new(self.config.event_history_capacity)));

        let shutdown = ShutdownSignal::new();
        let workflows = WorkflowPool::new(self.config.max_workflow_workers, shutdown.clone());
        let instance_id = self.config.resolve_instance_id();

        let seed = NodeConnectionStatus {
            disconnect_code: Some(DisconnectReasonCode::NotYetConnected),
            ..NodeConnectionStatus::new(
                self.local.clone(),
                NodeConnectionState::NotYetConnected,
                store.next_update_id(),
            )
        };
        store.put(seed);
        info!(node = %self.local, instance = %instance_id, "Cluster coordinator initialized");

        Ok(Arc::new(ClusterCoordinator {
            config: self.config,
            instance_id,
            local: self.local,
            store,
            leader,
            transport,
            firewall: self.firewall,
            flow_service,
            revisions: self.revisions,
            classifier: self.classifier,
            event_sink: self.event_sink,
            shutdown,
            workflows,
        }))
    }
}

impl ClusterCoordinator {
    pub fn builder(config: ClusterConfig, local: NodeIdentity) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            local,
            store: None,
            leader: None,
            transport: None,
            firewall: Arc::new(PermitAllFirewall),
            flow_service: None,
            revisions: Arc::new(StaticRevisionSource::default()),
            classifier: Arc::new(StatusCodeClassifier),
            event_sink: Arc::new(TracingEventSink),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn local_identity(&self) -> &NodeIdentity {
        &self.local
    }

    pub fn store(&self) -> &Arc<ConnectionStatusStore> {
        &self.store
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn ClusterTransport> {
        &self.transport
    }

    pub(crate) fn firewall(&self) -> &Arc<dyn Firewall> {
        &self.firewall
    }

    pub(crate) fn flow_service(&self) -> &Arc<dyn FlowService> {
        &self.flow_service
    }

    pub(crate) fn revision_source(&self) -> &Arc<dyn RevisionSource> {
        &self.revisions
    }

    pub(crate) fn classifier(&self) -> &Arc<dyn ResponseClassifier> {
        &self.classifier
    }

    pub(crate) fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.event_sink
    }

    pub(crate) fn workflows(&self) -> &WorkflowPool {
        &self.workflows
    }

    /// Whether this process is the elected cluster coordinator
    pub fn is_active_coordinator(&self) -> bool {
        self.leader.is_leader(ElectableRole::ClusterCoordinator)
    }

    pub fn status(&self, node_id: &str) -> Option<NodeConnectionStatus> {
        self.store.get(node_id)
    }

    pub fn statuses(&self) -> Vec<NodeConnectionStatus> {
        self.store.all()
    }

    /// Identities of nodes in any of `states`; no states means every node
    pub fn node_identities(&self, states: &[NodeConnectionState]) -> Vec<NodeIdentity> {
        let mut identities: Vec<_> = self.store.identities(states).into_iter().collect();
        identities.sort_by(|a, b| a.id().cmp(b.id()));
        identities
    }

    /// Nodes grouped by their current state
    pub fn connection_states(&self) -> HashMap<NodeConnectionState, Vec<NodeIdentity>> {
        let mut grouped: HashMap<NodeConnectionState, Vec<NodeIdentity>> = HashMap::new();
        for status in self.store.all() {
            grouped.entry(status.state).or_default().push(status.identity);
        }
        grouped
    }

    pub fn node_events(&self, node_id: &str) -> Vec<NodeEvent> {
        self.store.events(node_id)
    }

    pub fn find_node(&self, fragment: &str) -> Option<NodeIdentity> {
        self.store.find_by_uuid(fragment)
    }

    /// Apply `status` iff the stored update id still equals `qualifying_update_id`
    pub fn reset_status(&self, status: NodeConnectionStatus, qualifying_update_id: u64) -> bool {
        self.store.reset_status(status, qualifying_update_id)
    }

    /// Reconcile with a full snapshot, keeping newer local entries
    pub fn reset_all(&self, statuses: Vec<NodeConnectionStatus>) -> usize {
        self.store.reset_all(statuses)
    }

    /// A fresh status stamped with the next local update id
    pub fn new_status(&self, identity: NodeIdentity, state: NodeConnectionState) -> NodeConnectionStatus {
        NodeConnectionStatus::new(identity, state, self.store.next_update_id())
    }

    /// Record an event in the node's history and forward it to the event sink
    pub fn report_event(&self, node_id: &str, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        self.store.add_event(node_id, severity, message.clone());
        self.event_sink.report(Some(node_id), severity, &message);
    }

    /// Apply a locally decided status and tell the rest of the cluster
    ///
    /// When the coarse state did not change nobody is notified. Returns the
    /// number of peers that acknowledged the notification.
    pub async fn update_node_status(&self, status: NodeConnectionStatus, wait_for_coordinator: bool) -> usize {
        let previous = self.store.put(status.clone());
        self.propagate(previous.as_ref(), status, wait_for_coordinator).await
    }

    /// Like [`update_node_status`](Self::update_node_status) but only if the
    /// stored status is still `expected`
    pub async fn update_node_status_from(
        &self,
        expected: &NodeConnectionStatus,
        status: NodeConnectionStatus,
        wait_for_coordinator: bool,
    ) -> bool {
        if !self.store.replace(expected.node_id(), Some(expected), status.clone()) {
            debug!(node = %status.identity, "Status changed concurrently; not applying {}", status);
            return false;
        }
        self.propagate(Some(expected), status, wait_for_coordinator).await;
        true
    }

    async fn propagate(
        &self,
        previous: Option<&NodeConnectionStatus>,
        status: NodeConnectionStatus,
        wait_for_coordinator: bool,
    ) -> usize {
        self.store.observe_update_id(status.update_id);
        let previous_state = previous.map(|p| p.state);
        info!(
            node = %status.identity,
            from = ?previous_state,
            to = %status.state,
            update_id = status.update_id,
            "Status of node changed"
        );

        if previous_state == Some(status.state) {
            debug!(node = %status.identity, "State unchanged; not notifying other nodes");
            return 0;
        }
        self.notify_others(&status, self.is_active_coordinator(), wait_for_coordinator)
            .await
    }

    /// Send a status change to the nodes that should hear about it
    ///
    /// With `notify_all` every CONNECTED or CONNECTING node except this one is
    /// told. Otherwise only the elected coordinator is, optionally waiting for
    /// one to be elected.
    pub async fn notify_others(
        &self,
        status: &NodeConnectionStatus,
        notify_all: bool,
        wait_for_coordinator: bool,
    ) -> usize {
        let targets: Vec<NodeIdentity> = if notify_all {
            self.store
                .identities(&LIVE_STATES)
                .into_iter()
                .filter(|node| node != &self.local)
                .collect()
        } else {
            let coordinator = if wait_for_coordinator {
                self.wait_for_elected_coordinator().await
            } else {
                self.elected_coordinator().await
            };
            match coordinator {
                Some(coordinator) if coordinator != self.local => vec![coordinator],
                Some(_) => Vec::new(),
                None => {
                    debug!(node = %status.identity, "No coordinator known; status change not sent");
                    Vec::new()
                }
            }
        };
        if targets.is_empty() {
            return 0;
        }

        let notification = NodeStatusChangeNotification {
            node_id: status.node_id().to_string(),
            status: status.clone(),
            origin: Some(self.local.id().to_string()),
        };
        self.send_notifications(targets, &notification).await
    }

    /// Deliver `notification` to every target concurrently
    pub(crate) async fn send_notifications(
        &self,
        targets: Vec<NodeIdentity>,
        notification: &NodeStatusChangeNotification,
    ) -> usize {
        let timeout = self.config.request_timeout();
        let sends: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let transport = Arc::clone(&self.transport);
                let notification = notification.clone();
                tokio::spawn(async move {
                    let result =
                        tokio::time::timeout(timeout, transport.notify_status_change(&target, &notification))
                            .await
                            .map_err(ClusterError::from)
                            .and_then(|r| r);
                    (target, result)
                })
            })
            .collect();

        let mut delivered = 0;
        for send in sends {
            match send.await {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((target, Err(e))) => warn!(
                    node = %target,
                    error = %e,
                    "Failed to notify node of status change for {}",
                    notification.node_id
                ),
                Err(e) => warn!(error = %e, "Status change notification task failed"),
            }
        }
        delivered
    }

    /// Identity of the elected coordinator, if it can be determined
    ///
    /// The leader address is matched against known nodes' protocol endpoints.
    /// Failing that, the node at that address is asked for its status and the
    /// answer is remembered. Lookup failures are logged and yield `None`.
    pub async fn elected_coordinator(&self) -> Option<NodeIdentity> {
        let address = match self.leader.leader(ElectableRole::ClusterCoordinator).await {
            Ok(Some(address)) => address,
            Ok(None) | Err(ClusterError::NoLeader(_)) => {
                debug!("No cluster coordinator is currently elected");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to determine the elected cluster coordinator");
                return None;
            }
        };
        let (host, port) = match parse_leader_address(&address) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Leader election service returned an unusable address");
                return None;
            }
        };

        if let Some(known) = self
            .store
            .identities(&[])
            .into_iter()
            .find(|node| node.socket_address() == host && node.socket_port() == port)
        {
            return Some(known);
        }
        if self.is_shutting_down() {
            return None;
        }

        debug!(%address, "Coordinator is not a known node; requesting its status directly");
        match self.with_timeout(self.transport.request_node_status(&host, port)).await {
            Ok(status) => {
                let identity = status.identity.clone();
                match self.store.memoize(status) {
                    Some(_) => Some(identity),
                    None => {
                        debug!(node = %identity, "Coordinator was removed from the cluster; ignoring");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(%address, error = %e, "Failed to request status of the elected cluster coordinator");
                None
            }
        }
    }

    /// Poll until a coordinator is known, or `None` on shutdown
    pub async fn wait_for_elected_coordinator(&self) -> Option<NodeIdentity> {
        loop {
            if self.is_shutting_down() {
                return None;
            }
            if let Some(coordinator) = self.elected_coordinator().await {
                return Some(coordinator);
            }
            if !self.shutdown.sleep(self.config.coordinator_poll_interval()).await {
                return None;
            }
        }
    }

    /// Identity of the primary node, if it is a known node
    pub async fn primary_node(&self) -> Option<NodeIdentity> {
        let address = match self.leader.leader(ElectableRole::PrimaryNode).await {
            Ok(Some(address)) => address,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "Failed to determine the primary node");
                return None;
            }
        };
        let (host, port) = parse_leader_address(&address).ok()?;
        self.store
            .identities(&[])
            .into_iter()
            .find(|node| node.socket_address() == host && node.socket_port() == port)
    }

    /// Mark a node CONNECTED once it has finished joining
    ///
    /// An unknown node is asked to connect instead. A node that has since been
    /// disconnected stays disconnected.
    pub async fn finish_node_connection(self: &Arc<Self>, node: &NodeIdentity) -> ClusterResult<()> {
        let current = match self.store.get(node.id()) {
            Some(current) => current,
            None => {
                info!(node = %node, "Finishing connection of unknown node; requesting it connect");
                self.request_node_connect(node, None).await?;
                return Ok(());
            }
        };
        match current.state {
            NodeConnectionState::Connected => return Ok(()),
            NodeConnectionState::Disconnected | NodeConnectionState::Disconnecting => {
                info!(node = %node, state = %current.state, "Node was disconnected before its connection finished; ignoring");
                return Ok(());
            }
            _ => {}
        }

        info!(node = %node, "Finishing node connection");
        let status = self.new_status(node.clone(), NodeConnectionState::Connected);
        if self.update_node_status_from(&current, status, true).await {
            self.report_event(node.id(), Severity::Info, "Node connected to cluster");
        }
        Ok(())
    }

    /// Remove a node from the cluster on behalf of `requester`
    pub async fn remove_node(&self, node: &NodeIdentity, requester: &str) -> ClusterResult<()> {
        if self.store.get(node.id()).is_none() {
            return Err(ClusterError::UnknownNode(node.to_string()));
        }
        let message = format!("User {} requested that node be removed from cluster", requester);
        info!(node = %node, requester, "Removing node from cluster");
        self.event_sink.report(Some(node.id()), Severity::Info, &message);

        let removal = self.new_status(node.clone(), NodeConnectionState::Removed);
        self.update_node_status(removal, false).await;
        self.store.clear_events(node.id());
        Ok(())
    }

    /// Announce the local node's shutdown and stop background work
    pub async fn shutdown(&self) {
        if self.is_shutting_down() {
            return;
        }
        info!(node = %self.local, "Shutting down cluster coordinator");
        self.shutdown.trigger();

        let status = NodeConnectionStatus::disconnected(
            self.local.clone(),
            DisconnectReasonCode::NodeShutdown,
            Some("Node was shut down".to_string()),
            self.store.next_update_id(),
        );
        self.update_node_status(status, false).await;
        self.workflows.wait_idle().await;
    }

    /// Run an outbound exchange under the configured request timeout
    pub(crate) async fn with_timeout<T, F>(&self, exchange: F) -> ClusterResult<T>
    where
        F: Future<Output = ClusterResult<T>>,
    {
        tokio::time::timeout(self.config.request_timeout(), exchange).await?
    }
}

/// Event text describing a status change
pub(crate) fn describe_status_change(
    previous: Option<&NodeConnectionStatus>,
    status: &NodeConnectionStatus,
) -> String {
    let from = previous
        .map(|p| p.state.to_string())
        .unwrap_or_else(|| "[Unknown Node]".to_string());
    match (&status.reason, status.disconnect_code) {
        (Some(reason), _) => format!(
            "Node Status changed from {} to {} due to {}",
            from, status.state, reason
        ),
        (None, Some(code)) => format!(
            "Node Status changed from {} to {} due to {}",
            from, status.state, code
        ),
        (None, None) => format!("Node Status changed from {} to {}", from, status.state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity::new(id, format!("{}.local", id), 8080, format!("{}.local", id), 9090)
    }

    #[test]
    fn test_describe_status_change() {
        let connected = NodeConnectionStatus::new(identity("n1"), NodeConnectionState::Connected, 1);
        assert_eq!(
            describe_status_change(None, &connected),
            "Node Status changed from [Unknown Node] to CONNECTED"
        );

        let disconnected = NodeConnectionStatus::disconnected(
            identity("n1"),
            DisconnectReasonCode::LackOfHeartbeat,
            None,
            2,
        );
        let text = describe_status_change(Some(&connected), &disconnected);
        assert!(text.starts_with("Node Status changed from CONNECTED to DISCONNECTED due to "));

        let explained = NodeConnectionStatus::disconnected(
            identity("n1"),
            DisconnectReasonCode::UserDisconnected,
            Some("maintenance".to_string()),
            3,
        );
        assert!(describe_status_change(Some(&connected), &explained).ends_with("due to maintenance"));
    }
}

//! Shared fixtures for coordinator integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use rill::cluster::{
    ClusterTransport, DisconnectNotification, ElectableRole, EventSink, NodeStatusChangeNotification,
    ReconnectionRequest, StaticFlowService, StaticLeaderReference,
};
use rill::{
    ClusterConfig, ClusterCoordinator, ClusterError, ClusterResult, NodeConnectionState,
    NodeConnectionStatus, NodeIdentity, Severity,
};

pub fn identity(id: &str) -> NodeIdentity {
    NodeIdentity::new(id, format!("{}.cluster", id), 8080, format!("{}.cluster", id), 11443)
}

/// Short delays and few attempts so workflows finish quickly
pub fn fast_config() -> ClusterConfig {
    ClusterConfig {
        reconnect_attempts: 3,
        reconnect_retry_delay_ms: 10,
        disconnect_attempts: 3,
        disconnect_retry_delay_ms: 10,
        flow_service_poll_interval_ms: 5,
        coordinator_poll_interval_ms: 5,
        request_timeout_ms: 1_000,
        max_workflow_workers: 4,
        cluster_instance_id: Some("test-cluster".to_string()),
        ..ClusterConfig::default()
    }
}

/// Transport that records every outbound exchange
#[derive(Default)]
pub struct RecordingTransport {
    pub notifications: Mutex<Vec<(String, NodeStatusChangeNotification)>>,
    pub status_requests: Mutex<Vec<(String, u16)>>,
    pub reconnections: Mutex<Vec<ReconnectionRequest>>,
    pub disconnects: Mutex<Vec<DisconnectNotification>>,
    pub remote_statuses: Mutex<HashMap<(String, u16), NodeConnectionStatus>>,
    pub fail_notifications: AtomicBool,
    pub fail_reconnection: AtomicBool,
    pub garble_reconnection: AtomicBool,
    pub reconnection_delay_ms: AtomicU64,
    pub fail_disconnect: AtomicBool,
}

impl RecordingTransport {
    /// Ids of nodes that were sent a status change, sorted
    pub fn notified_targets(&self) -> Vec<String> {
        let mut targets: Vec<_> = self
            .notifications
            .lock()
            .iter()
            .map(|(target, _)| target.clone())
            .collect();
        targets.sort();
        targets
    }

    pub fn clear(&self) {
        self.notifications.lock().clear();
        self.status_requests.lock().clear();
        self.reconnections.lock().clear();
        self.disconnects.lock().clear();
    }
}

#[async_trait]
impl ClusterTransport for RecordingTransport {
    async fn notify_status_change(
        &self,
        target: &NodeIdentity,
        notification: &NodeStatusChangeNotification,
    ) -> ClusterResult<()> {
        self.notifications
            .lock()
            .push((target.id().to_string(), notification.clone()));
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err(ClusterError::Transport("unreachable".to_string()));
        }
        Ok(())
    }

    async fn request_node_status(&self, host: &str, port: u16) -> ClusterResult<NodeConnectionStatus> {
        self.status_requests.lock().push((host.to_string(), port));
        self.remote_statuses
            .lock()
            .get(&(host.to_string(), port))
            .cloned()
            .ok_or_else(|| ClusterError::Transport(format!("nobody at {}:{}", host, port)))
    }

    async fn request_reconnection(&self, request: &ReconnectionRequest) -> ClusterResult<()> {
        self.reconnections.lock().push(request.clone());
        let delay = self.reconnection_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.garble_reconnection.load(Ordering::SeqCst) {
            return Err(ClusterError::Codec("unexpected frame".to_string()));
        }
        if self.fail_reconnection.load(Ordering::SeqCst) {
            return Err(ClusterError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self, notification: &DisconnectNotification) -> ClusterResult<()> {
        self.disconnects.lock().push(notification.clone());
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(ClusterError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

/// Event sink that keeps everything it is given
#[derive(Default)]
pub struct RecordingEventSink {
    pub events: Mutex<Vec<(Option<String>, Severity, String)>>,
}

impl RecordingEventSink {
    pub fn contains(&self, severity: Severity, fragment: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|(_, s, message)| *s == severity && message.contains(fragment))
    }
}

impl EventSink for RecordingEventSink {
    fn report(&self, node_id: Option<&str>, severity: Severity, message: &str) {
        self.events
            .lock()
            .push((node_id.map(str::to_string), severity, message.to_string()));
    }
}

pub struct Harness {
    pub coordinator: Arc<ClusterCoordinator>,
    pub transport: Arc<RecordingTransport>,
    pub leader: Arc<StaticLeaderReference>,
    pub flow: Arc<StaticFlowService>,
    pub events: Arc<RecordingEventSink>,
    pub local: NodeIdentity,
}

impl Harness {
    /// Coordinator for node `local_id`, elected when `elected` is set
    pub fn new(local_id: &str, elected: bool) -> Self {
        Self::with_config(local_id, elected, fast_config())
    }

    pub fn with_config(local_id: &str, elected: bool, config: ClusterConfig) -> Self {
        let local = identity(local_id);
        let transport = Arc::new(RecordingTransport::default());
        let leader = Arc::new(StaticLeaderReference::new(local.socket_endpoint()));
        if elected {
            leader.assign(ElectableRole::ClusterCoordinator, Some(local.socket_endpoint()));
        }
        let flow = Arc::new(StaticFlowService::new(b"<flow/>".to_vec()));
        let events = Arc::new(RecordingEventSink::default());

        let coordinator = ClusterCoordinator::builder(config, local.clone())
            .leader(leader.clone())
            .transport(transport.clone())
            .flow_service(flow.clone())
            .event_sink(events.clone())
            .build()
            .unwrap();

        Self {
            coordinator,
            transport,
            leader,
            flow,
            events,
            local,
        }
    }

    /// Put nodes straight into the store without any fan-out
    pub fn seed(&self, ids: &[&str], state: NodeConnectionState) {
        for id in ids {
            let status = self.coordinator.new_status(identity(id), state);
            self.coordinator.store().put(status);
        }
    }

    pub fn state_of(&self, id: &str) -> Option<NodeConnectionState> {
        self.coordinator.store().state_of(id)
    }
}

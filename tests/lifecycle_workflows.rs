//! Reconnection and disconnection workflows

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{fast_config, identity, Harness};
use rill::cluster::WorkflowOutcome;
use rill::{
    ClusterConfig, ClusterError, DisconnectReasonCode, NodeConnectionState, Severity,
};

const WORKFLOW_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_reconnection_succeeds() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1", "n2"], NodeConnectionState::Connected);
    harness.seed(&["n3"], NodeConnectionState::Disconnected);

    let handle = harness
        .coordinator
        .request_node_connect(&identity("n3"), Some("admin"))
        .await
        .unwrap();
    assert_eq!(harness.state_of("n3"), Some(NodeConnectionState::Connecting));

    let outcome = tokio::time::timeout(WORKFLOW_DEADLINE, handle).await.unwrap().unwrap();
    assert_eq!(outcome, WorkflowOutcome::Completed);

    let requests = harness.transport.reconnections.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].node_id, identity("n3"));
    assert_eq!(requests[0].instance_id, "test-cluster");
    assert_eq!(requests[0].flow, b"<flow/>".to_vec());
    assert_eq!(requests[0].statuses.len(), 3);
    assert!(harness.events.contains(Severity::Info, "on behalf of admin"));
}

#[tokio::test]
async fn test_exhausted_reconnection_marks_node_disconnected() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1", "n2"], NodeConnectionState::Connected);
    harness.transport.fail_reconnection.store(true, Ordering::SeqCst);

    let handle = harness
        .coordinator
        .request_node_connect(&identity("n2"), None)
        .await
        .unwrap();
    let outcome = tokio::time::timeout(WORKFLOW_DEADLINE, handle).await.unwrap().unwrap();

    assert_eq!(outcome, WorkflowOutcome::Exhausted);
    assert_eq!(harness.transport.reconnections.lock().len(), 3);

    let status = harness.coordinator.status("n2").unwrap();
    assert_eq!(status.state, NodeConnectionState::Disconnected);
    assert_eq!(status.disconnect_code, Some(DisconnectReasonCode::UnableToCommunicate));
    assert!(harness.events.contains(Severity::Warning, "Problem encountered issuing reconnection request"));
    assert!(harness.events.contains(Severity::Error, "could not communicate with node"));
}

#[tokio::test]
async fn test_reconnection_abandoned_when_status_moves_on() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1", "n3"], NodeConnectionState::Connected);
    harness.flow.set_flow(None);

    let handle = harness
        .coordinator
        .request_node_connect(&identity("n2"), None)
        .await
        .unwrap();

    // The node connects some other way while the flow is still loading
    harness.seed(&["n2"], NodeConnectionState::Connected);
    harness.flow.set_flow(Some(b"<flow/>".to_vec()));

    let outcome = tokio::time::timeout(WORKFLOW_DEADLINE, handle).await.unwrap().unwrap();
    assert_eq!(outcome, WorkflowOutcome::Abandoned);
    assert!(harness.transport.reconnections.lock().is_empty());
    assert_eq!(harness.state_of("n2"), Some(NodeConnectionState::Connected));
}

#[tokio::test]
async fn test_exhaustion_does_not_clobber_newer_status() {
    let config = ClusterConfig {
        reconnect_attempts: 2,
        reconnect_retry_delay_ms: 100,
        ..fast_config()
    };
    let harness = Harness::with_config("n1", true, config);
    harness.seed(&["n1"], NodeConnectionState::Connected);
    harness.transport.fail_reconnection.store(true, Ordering::SeqCst);

    let handle = harness
        .coordinator
        .request_node_connect(&identity("n2"), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    harness.seed(&["n2"], NodeConnectionState::Disconnecting);

    let outcome = tokio::time::timeout(WORKFLOW_DEADLINE, handle).await.unwrap().unwrap();
    assert_eq!(outcome, WorkflowOutcome::Abandoned);
    // The second attempt never went out
    assert_eq!(harness.transport.reconnections.lock().len(), 1);
    assert_eq!(harness.state_of("n2"), Some(NodeConnectionState::Disconnecting));
}

#[tokio::test]
async fn test_last_connected_node_cannot_be_disconnected() {
    let harness = Harness::new("n1", true);
    harness.coordinator.finish_node_connection(&identity("n1")).await.unwrap();
    harness.seed(&["n2"], NodeConnectionState::Disconnected);
    harness.transport.clear();

    let result = harness
        .coordinator
        .request_node_disconnect(&identity("n1"), DisconnectReasonCode::UserDisconnected, "maintenance")
        .await;

    assert!(matches!(result, Err(ClusterError::IllegalDisconnection(_))));
    assert_eq!(harness.state_of("n1"), Some(NodeConnectionState::Connected));
    assert!(harness.transport.notified_targets().is_empty());
    assert!(harness.transport.disconnects.lock().is_empty());
}

#[tokio::test]
async fn test_shutdown_disconnect_skips_workflow() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1", "n2"], NodeConnectionState::Connected);

    let handle = harness
        .coordinator
        .request_node_disconnect(&identity("n2"), DisconnectReasonCode::NodeShutdown, "node shut down")
        .await
        .unwrap();

    assert!(handle.is_none());
    let status = harness.coordinator.status("n2").unwrap();
    assert_eq!(status.state, NodeConnectionState::Disconnected);
    assert_eq!(status.disconnect_code, Some(DisconnectReasonCode::NodeShutdown));
    assert!(harness.transport.disconnects.lock().is_empty());
}

#[tokio::test]
async fn test_disconnection_workflow_notifies_node() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1", "n2", "n3"], NodeConnectionState::Connected);

    let handle = harness
        .coordinator
        .request_node_disconnect(&identity("n2"), DisconnectReasonCode::UserDisconnected, "maintenance")
        .await
        .unwrap()
        .expect("a disconnection workflow should start");

    let outcome = tokio::time::timeout(WORKFLOW_DEADLINE, handle).await.unwrap().unwrap();
    assert_eq!(outcome, WorkflowOutcome::Completed);

    let sent = harness.transport.disconnects.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].node_id, identity("n2"));
    assert_eq!(sent[0].explanation, "maintenance");

    let messages: Vec<_> = harness
        .coordinator
        .node_events("n2")
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert!(messages.iter().any(|m| m == "Disconnection requested due to maintenance"));
    assert!(messages.iter().any(|m| m == "Node disconnected due to maintenance"));

    // Peers still live heard about the disconnection
    assert_eq!(harness.transport.notified_targets(), vec!["n3"]);
}

#[tokio::test]
async fn test_disconnection_workflow_gives_up() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1", "n2"], NodeConnectionState::Connected);
    harness.transport.fail_disconnect.store(true, Ordering::SeqCst);

    let handle = harness
        .coordinator
        .request_node_disconnect(&identity("n2"), DisconnectReasonCode::LackOfHeartbeat, "silent")
        .await
        .unwrap()
        .unwrap();

    let outcome = tokio::time::timeout(WORKFLOW_DEADLINE, handle).await.unwrap().unwrap();
    assert_eq!(outcome, WorkflowOutcome::Exhausted);
    assert_eq!(harness.transport.disconnects.lock().len(), 3);
    assert_eq!(harness.state_of("n2"), Some(NodeConnectionState::Disconnected));
}

#[tokio::test]
async fn test_node_reported_disconnection_uses_code_severity() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1", "n2", "n3"], NodeConnectionState::Connected);

    harness
        .coordinator
        .disconnection_requested_by_node(&identity("n2"), DisconnectReasonCode::LackOfHeartbeat, None)
        .await;
    harness
        .coordinator
        .disconnection_requested_by_node(
            &identity("n3"),
            DisconnectReasonCode::MismatchedFlows,
            Some("flow fingerprint differs".to_string()),
        )
        .await;

    assert_eq!(harness.state_of("n2"), Some(NodeConnectionState::Disconnected));
    assert!(harness.events.contains(Severity::Warning, "due to Lack of Heartbeat"));
    assert!(harness.events.contains(Severity::Error, "due to flow fingerprint differs"));
    assert_eq!(
        harness.coordinator.status("n3").unwrap().reason.as_deref(),
        Some("flow fingerprint differs")
    );
}

#[tokio::test]
async fn test_finish_and_remove_node() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1", "n3"], NodeConnectionState::Connected);
    harness.seed(&["n2"], NodeConnectionState::Connecting);

    harness.coordinator.finish_node_connection(&identity("n2")).await.unwrap();
    assert_eq!(harness.state_of("n2"), Some(NodeConnectionState::Connected));
    assert!(!harness.coordinator.node_events("n2").is_empty());

    harness.transport.clear();
    harness.coordinator.remove_node(&identity("n2"), "admin").await.unwrap();

    assert!(harness.coordinator.status("n2").is_none());
    assert!(harness.coordinator.node_events("n2").is_empty());
    assert!(harness.events.contains(Severity::Info, "User admin requested that node be removed"));
    let removals = harness.transport.notifications.lock().clone();
    assert_eq!(removals.len(), 1);
    assert_eq!(removals[0].0, "n3");
    assert_eq!(removals[0].1.status.state, NodeConnectionState::Removed);

    let missing = harness.coordinator.remove_node(&identity("n2"), "admin").await;
    assert!(matches!(missing, Err(ClusterError::UnknownNode(_))));
}

#[tokio::test]
async fn test_finish_connection_edge_cases() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1"], NodeConnectionState::Connected);
    harness.seed(&["n2"], NodeConnectionState::Disconnected);

    // A disconnect that arrived first wins
    harness.coordinator.finish_node_connection(&identity("n2")).await.unwrap();
    assert_eq!(harness.state_of("n2"), Some(NodeConnectionState::Disconnected));

    // An unknown node is asked to connect
    harness.coordinator.finish_node_connection(&identity("n7")).await.unwrap();
    assert_eq!(harness.state_of("n7"), Some(NodeConnectionState::Connecting));

    let deadline = tokio::time::Instant::now() + WORKFLOW_DEADLINE;
    while harness.transport.reconnections.lock().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "reconnection request not sent");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.transport.reconnections.lock()[0].node_id, identity("n7"));
}

#[tokio::test]
async fn test_shutdown_cancels_workflows() {
    let config = ClusterConfig {
        reconnect_retry_delay_ms: 60_000,
        ..fast_config()
    };
    let harness = Harness::with_config("n1", true, config);
    harness.seed(&["n1", "n3"], NodeConnectionState::Connected);
    harness.transport.fail_reconnection.store(true, Ordering::SeqCst);

    let handle = harness
        .coordinator
        .request_node_connect(&identity("n2"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(WORKFLOW_DEADLINE, harness.coordinator.shutdown())
        .await
        .unwrap();
    let outcome = tokio::time::timeout(WORKFLOW_DEADLINE, handle).await.unwrap().unwrap();
    assert_eq!(outcome, WorkflowOutcome::Cancelled);

    let local = harness.coordinator.status("n1").unwrap();
    assert_eq!(local.state, NodeConnectionState::Disconnected);
    assert_eq!(local.disconnect_code, Some(DisconnectReasonCode::NodeShutdown));

    let refused = harness.coordinator.request_node_connect(&identity("n2"), None).await;
    assert!(matches!(refused, Err(ClusterError::ShuttingDown)));
}

#[tokio::test]
async fn test_shutdown_during_final_attempt_skips_exhaustion() {
    let config = ClusterConfig {
        reconnect_attempts: 1,
        ..fast_config()
    };
    let harness = Harness::with_config("n1", true, config);
    harness.seed(&["n1", "n3"], NodeConnectionState::Connected);
    harness.transport.fail_reconnection.store(true, Ordering::SeqCst);
    harness.transport.reconnection_delay_ms.store(500, Ordering::SeqCst);

    let handle = harness
        .coordinator
        .request_node_connect(&identity("n2"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.transport.reconnections.lock().len(), 1);
    harness.transport.notifications.lock().clear();

    tokio::time::timeout(WORKFLOW_DEADLINE, harness.coordinator.shutdown())
        .await
        .unwrap();
    let outcome = tokio::time::timeout(WORKFLOW_DEADLINE, handle).await.unwrap().unwrap();

    assert_eq!(outcome, WorkflowOutcome::Cancelled);
    assert_eq!(harness.state_of("n2"), Some(NodeConnectionState::Connecting));
    let announced: Vec<_> = harness
        .transport
        .notifications
        .lock()
        .iter()
        .map(|(_, n)| n.status.node_id().to_string())
        .collect();
    assert!(announced.iter().all(|id| id == "n1"), "announced {:?}", announced);
    assert!(!harness.events.contains(Severity::Error, "could not communicate with node"));
}

#[tokio::test]
async fn test_unretryable_reconnection_failure_stops_early() {
    let harness = Harness::new("n1", true);
    harness.seed(&["n1", "n3"], NodeConnectionState::Connected);
    harness.transport.garble_reconnection.store(true, Ordering::SeqCst);

    let handle = harness
        .coordinator
        .request_node_connect(&identity("n2"), None)
        .await
        .unwrap();
    let outcome = tokio::time::timeout(WORKFLOW_DEADLINE, handle).await.unwrap().unwrap();

    assert_eq!(outcome, WorkflowOutcome::Exhausted);
    assert_eq!(harness.transport.reconnections.lock().len(), 1);
    assert_eq!(harness.state_of("n2"), Some(NodeConnectionState::Disconnected));
}

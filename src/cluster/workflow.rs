//! Lifecycle workflows
//!
//! Reconnection and disconnection run as retrying background workflows on a
//! bounded pool. Each attempt first re-checks the target's status and the
//! workflow quietly stops once the status no longer calls for it. Every sleep
//! and every outbound attempt is interruptible by the shutdown signal.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::coordinator::ClusterCoordinator;
use super::messages::{DisconnectNotification, ReconnectionRequest};
use crate::error::{ClusterError, ClusterResult};
use crate::types::{
    DisconnectReasonCode, NodeConnectionState, NodeConnectionStatus, NodeIdentity, Severity,
};

/// Process-wide shutdown flag that sleeping tasks can wait on
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been triggered
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless shutdown comes first
    ///
    /// Returns `false` when the sleep was cut short by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_triggered(),
            _ = self.triggered() => false,
        }
    }

    /// Drive `future` unless shutdown comes first
    ///
    /// Returns `None` when shutdown won the race.
    pub async fn interruptible<F: Future>(&self, future: F) -> Option<F::Output> {
        if self.is_triggered() {
            return None;
        }
        tokio::select! {
            output = future => Some(output),
            _ = self.triggered() => None,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// How a workflow ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// The target acknowledged
    Completed,
    /// The target's status changed and the workflow no longer applied
    Abandoned,
    /// Every attempt failed
    Exhausted,
    /// Shutdown interrupted the workflow
    Cancelled,
}

/// Bounded pool running lifecycle workflows
#[derive(Debug)]
pub struct WorkflowPool {
    permits: Arc<Semaphore>,
    shutdown: ShutdownSignal,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

struct ActiveGuard {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl WorkflowPool {
    pub fn new(max_workers: usize, shutdown: ShutdownSignal) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            shutdown,
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Queue a workflow; it starts once a worker is free
    pub fn spawn<F>(&self, name: String, workflow: F) -> JoinHandle<WorkflowOutcome>
    where
        F: Future<Output = WorkflowOutcome> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            idle: Arc::clone(&self.idle),
        };
        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return WorkflowOutcome::Cancelled,
                },
                _ = shutdown.triggered() => return WorkflowOutcome::Cancelled,
            };
            if shutdown.is_triggered() {
                return WorkflowOutcome::Cancelled;
            }
            debug!(workflow = %name, "Workflow started");
            let outcome = workflow.await;
            debug!(workflow = %name, ?outcome, "Workflow finished");
            outcome
        })
    }

    /// Workflows queued or running
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until no workflow is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl ClusterCoordinator {
    /// Ask a node to (re)join the cluster
    ///
    /// Marks the node CONNECTING and starts the reconnection workflow.
    pub async fn request_node_connect(
        self: &Arc<Self>,
        node: &NodeIdentity,
        requester: Option<&str>,
    ) -> ClusterResult<JoinHandle<WorkflowOutcome>> {
        if self.is_shutting_down() {
            return Err(ClusterError::ShuttingDown);
        }

        info!(node = %node, "Attempting to connect node to cluster");
        self.report_event(
            node.id(),
            Severity::Info,
            format!(
                "Requesting that node connect to cluster on behalf of {}",
                requester.unwrap_or("the cluster coordinator")
            ),
        );

        let status = self.new_status(node.clone(), NodeConnectionState::Connecting);
        self.update_node_status(status, true).await;

        let coordinator = Arc::clone(self);
        let target = node.clone();
        Ok(self.workflows().spawn(
            format!("Reconnect {}", node),
            async move { coordinator.run_reconnection(target).await },
        ))
    }

    async fn run_reconnection(&self, target: NodeIdentity) -> WorkflowOutcome {
        let shutdown = self.shutdown_signal().clone();

        while !self.flow_service().is_initialized() {
            debug!(node = %target, "Waiting for flow service before requesting reconnection");
            if !shutdown.sleep(self.config().flow_service_poll_interval()).await {
                return WorkflowOutcome::Cancelled;
            }
        }

        let attempts = self.config().reconnect_attempts;
        for attempt in 1..=attempts {
            if shutdown.is_triggered() {
                return WorkflowOutcome::Cancelled;
            }
            if self.store().state_of(target.id()) != Some(NodeConnectionState::Connecting) {
                debug!(node = %target, "Node is no longer connecting; abandoning reconnection");
                return WorkflowOutcome::Abandoned;
            }

            let result = match shutdown.interruptible(self.attempt_reconnection(&target)).await {
                Some(result) => result,
                None => return WorkflowOutcome::Cancelled,
            };
            match result {
                Ok(()) => {
                    info!(node = %target, attempt, "Successfully requested that node join the cluster");
                    return WorkflowOutcome::Completed;
                }
                Err(e) => {
                    warn!(node = %target, attempt, error = %e, "Problem encountered issuing reconnection request");
                    self.event_sink().report(
                        Some(target.id()),
                        Severity::Warning,
                        &format!(
                            "Problem encountered issuing reconnection request to node {} due to: {}",
                            target, e
                        ),
                    );
                    if !e.is_transient() {
                        error!(node = %target, error = %e, "Reconnection failure is not retryable");
                        break;
                    }
                }
            }

            if attempt < attempts && !shutdown.sleep(self.config().reconnect_retry_delay()).await {
                return WorkflowOutcome::Cancelled;
            }
        }

        if shutdown.is_triggered() {
            return WorkflowOutcome::Cancelled;
        }
        let current = match self.store().get(target.id()) {
            Some(current) if current.state == NodeConnectionState::Connecting => current,
            _ => return WorkflowOutcome::Abandoned,
        };
        let explanation =
            "Attempted to request that node reconnect to cluster but could not communicate with node";
        let status = NodeConnectionStatus::disconnected(
            target.clone(),
            DisconnectReasonCode::UnableToCommunicate,
            Some(explanation.to_string()),
            self.store().next_update_id(),
        );
        if !self.update_node_status_from(&current, status, true).await {
            return WorkflowOutcome::Abandoned;
        }
        self.report_event(target.id(), Severity::Error, explanation);
        WorkflowOutcome::Exhausted
    }

    async fn attempt_reconnection(&self, target: &NodeIdentity) -> ClusterResult<()> {
        let flow = self.flow_service().current_flow().await?;
        let request = ReconnectionRequest {
            node_id: target.clone(),
            instance_id: self.instance_id().to_string(),
            flow,
            statuses: self.store().all(),
            revisions: self.revision_source().all_revisions(),
        };
        self.with_timeout(self.transport().request_reconnection(&request)).await
    }

    /// Disconnect a node and tell it so
    ///
    /// Rejected when the node is the only CONNECTED node. Returns the handle of
    /// the disconnection workflow, or `None` when the node is shutting down and
    /// cannot be reached anyway.
    pub async fn request_node_disconnect(
        self: &Arc<Self>,
        node: &NodeIdentity,
        code: DisconnectReasonCode,
        explanation: impl Into<String>,
    ) -> ClusterResult<Option<JoinHandle<WorkflowOutcome>>> {
        let explanation = explanation.into();
        let connected = self.store().identities(&[NodeConnectionState::Connected]);
        if connected.len() == 1 && connected.contains(node) {
            return Err(ClusterError::IllegalDisconnection(format!(
                "Cannot disconnect node {} because it is the only node currently connected",
                node
            )));
        }
        if self.is_shutting_down() {
            return Err(ClusterError::ShuttingDown);
        }

        info!(node = %node, reason = %explanation, "Requesting that node disconnect");
        let status = NodeConnectionStatus::disconnected(
            node.clone(),
            code,
            Some(explanation.clone()),
            self.store().next_update_id(),
        );
        self.update_node_status(status, true).await;

        if code == DisconnectReasonCode::NodeShutdown {
            return Ok(None);
        }

        self.store().add_event(
            node.id(),
            Severity::Info,
            format!("Disconnection requested due to {}", explanation),
        );
        let notification = DisconnectNotification {
            node_id: node.clone(),
            explanation,
        };
        let coordinator = Arc::clone(self);
        Ok(Some(self.workflows().spawn(
            format!("Disconnect {}", node),
            async move { coordinator.run_disconnection(notification).await },
        )))
    }

    async fn run_disconnection(&self, notification: DisconnectNotification) -> WorkflowOutcome {
        let shutdown = self.shutdown_signal().clone();
        let target = &notification.node_id;
        let attempts = self.config().disconnect_attempts;

        for attempt in 1..=attempts {
            if shutdown.is_triggered() {
                return WorkflowOutcome::Cancelled;
            }
            match self.store().state_of(target.id()) {
                Some(NodeConnectionState::Disconnected) | Some(NodeConnectionState::Disconnecting) => {}
                _ => {
                    debug!(node = %target, "Node is no longer disconnected; abandoning disconnection");
                    return WorkflowOutcome::Abandoned;
                }
            }

            let exchange = self.with_timeout(self.transport().disconnect(&notification));
            let result = match shutdown.interruptible(exchange).await {
                Some(result) => result,
                None => return WorkflowOutcome::Cancelled,
            };
            match result {
                Ok(()) => {
                    self.report_event(
                        target.id(),
                        Severity::Info,
                        format!("Node disconnected due to {}", notification.explanation),
                    );
                    return WorkflowOutcome::Completed;
                }
                Err(e) => {
                    error!(
                        node = %target,
                        attempt,
                        error = %e,
                        "Failed to notify node that it has been disconnected from the cluster due to {}",
                        notification.explanation
                    );
                    if !e.is_transient() {
                        break;
                    }
                }
            }

            if attempt < attempts && !shutdown.sleep(self.config().disconnect_retry_delay()).await {
                return WorkflowOutcome::Cancelled;
            }
        }
        WorkflowOutcome::Exhausted
    }

    /// A node reports that it is leaving the cluster
    pub async fn disconnection_requested_by_node(
        &self,
        node: &NodeIdentity,
        code: DisconnectReasonCode,
        explanation: Option<String>,
    ) {
        let reason = explanation.clone().unwrap_or_else(|| code.to_string());
        info!(node = %node, reason = %reason, "Node requested disconnection from cluster");

        let status = NodeConnectionStatus::disconnected(
            node.clone(),
            code,
            explanation,
            self.store().next_update_id(),
        );
        self.update_node_status(status, true).await;
        self.report_event(
            node.id(),
            code.severity(),
            format!("Node disconnected from cluster due to {}", reason),
        );
    }
}

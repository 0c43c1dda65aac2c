//! Post-replication policy
//!
//! After a mutating request has been replicated to every node, nodes that
//! failed to service it are disconnected so they cannot drift from the rest
//! of the cluster.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use super::collaborators::ResponseClassifier;
use super::coordinator::ClusterCoordinator;
use crate::types::{DisconnectReasonCode, NodeIdentity, NodeResponse};

/// What to do about a replicated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationVerdict {
    /// Not coordinator, or the method does not mutate anything
    NotApplicable,
    /// Every node serviced the request
    NoFailures,
    /// Every node failed, so no node is singled out
    ClusterWideFailure,
    /// Only a missing-counter lookup failed somewhere
    MissingCounter,
    /// These nodes failed and must be disconnected
    Disconnect(Vec<NodeIdentity>),
}

pub fn is_mutable_method(method: &str) -> bool {
    ["POST", "PUT", "DELETE"]
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
}

/// Whether `path` addresses a single counter, i.e. `prefix` then a UUID
pub fn is_counter_path(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.len() == 36 && Uuid::parse_str(rest).is_ok(),
        None => false,
    }
}

/// Classify the outcome of a replicated request
pub fn evaluate(
    classifier: &dyn ResponseClassifier,
    counters_prefix: &str,
    uri_path: &str,
    method: &str,
    responses: &[NodeResponse],
) -> ReplicationVerdict {
    if !is_mutable_method(method) {
        return ReplicationVerdict::NotApplicable;
    }
    let problematic = classifier.problematic_responses(responses);
    if problematic.is_empty() {
        return ReplicationVerdict::NoFailures;
    }
    if problematic.len() == responses.len() {
        return ReplicationVerdict::ClusterWideFailure;
    }
    if problematic.iter().all(|r| r.status == 404) && is_counter_path(counters_prefix, uri_path) {
        return ReplicationVerdict::MissingCounter;
    }
    ReplicationVerdict::Disconnect(problematic.into_iter().map(|r| r.node).collect())
}

impl ClusterCoordinator {
    /// Disconnect nodes that failed a replicated mutating request
    ///
    /// Only acts on the elected coordinator. Returns the nodes for which a
    /// disconnection was requested.
    pub async fn after_request(
        self: &Arc<Self>,
        uri_path: &str,
        method: &str,
        responses: &[NodeResponse],
    ) -> Vec<NodeIdentity> {
        if !self.is_active_coordinator() {
            return Vec::new();
        }
        let verdict = evaluate(
            self.classifier().as_ref(),
            &self.config().counters_path_prefix,
            uri_path,
            method,
            responses,
        );

        let failed = match verdict {
            ReplicationVerdict::Disconnect(nodes) => nodes,
            ReplicationVerdict::ClusterWideFailure => {
                warn!(
                    %method,
                    path = uri_path,
                    "All nodes failed to process request; no node will be disconnected"
                );
                return Vec::new();
            }
            other => {
                debug!(%method, path = uri_path, verdict = ?other, "No nodes to disconnect after request");
                return Vec::new();
            }
        };

        let explanation = format!("Failed to process request {} {}", method, uri_path);
        let mut disconnected = Vec::with_capacity(failed.len());
        for node in failed {
            match self
                .request_node_disconnect(&node, DisconnectReasonCode::FailedToServiceRequest, explanation.clone())
                .await
            {
                Ok(_) => disconnected.push(node),
                Err(e) => warn!(node = %node, error = %e, "Could not disconnect node after failed request"),
            }
        }
        disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::collaborators::StatusCodeClassifier;

    const PREFIX: &str = "/flow-api/counters/";

    fn responses(codes: &[u16]) -> Vec<NodeResponse> {
        codes
            .iter()
            .enumerate()
            .map(|(i, code)| {
                let id = format!("n{}", i);
                NodeResponse::new(NodeIdentity::new(id.clone(), id.clone(), 80, id, 90), *code)
            })
            .collect()
    }

    #[test]
    fn test_mutable_methods() {
        assert!(is_mutable_method("POST"));
        assert!(is_mutable_method("put"));
        assert!(is_mutable_method("Delete"));
        assert!(!is_mutable_method("GET"));
        assert!(!is_mutable_method("HEAD"));
    }

    #[test]
    fn test_counter_path() {
        let id = Uuid::new_v4();
        assert!(is_counter_path(PREFIX, &format!("{}{}", PREFIX, id)));
        assert!(!is_counter_path(PREFIX, PREFIX));
        assert!(!is_counter_path(PREFIX, &format!("{}not-a-uuid-at-all-but-36-chars-long", PREFIX)));
        assert!(!is_counter_path(PREFIX, &format!("/flow-api/processors/{}", id)));
    }

    #[test]
    fn test_reads_are_ignored() {
        let verdict = evaluate(&StatusCodeClassifier, PREFIX, "/flow-api/x", "GET", &responses(&[200, 500]));
        assert_eq!(verdict, ReplicationVerdict::NotApplicable);
    }

    #[test]
    fn test_partial_failure_disconnects_failed_nodes() {
        let verdict = evaluate(
            &StatusCodeClassifier,
            PREFIX,
            "/flow-api/processors/p1",
            "PUT",
            &responses(&[200, 200, 500, 200, 409]),
        );
        match verdict {
            ReplicationVerdict::Disconnect(nodes) => {
                let ids: Vec<_> = nodes.iter().map(|n| n.id().to_string()).collect();
                assert_eq!(ids, vec!["n2", "n4"]);
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_total_failure_disconnects_nobody() {
        let verdict = evaluate(&StatusCodeClassifier, PREFIX, "/x", "POST", &responses(&[500, 500, 503]));
        assert_eq!(verdict, ReplicationVerdict::ClusterWideFailure);
    }

    #[test]
    fn test_missing_counter_is_tolerated() {
        let path = format!("{}{}", PREFIX, Uuid::new_v4());
        let verdict = evaluate(&StatusCodeClassifier, PREFIX, &path, "PUT", &responses(&[200, 404, 200]));
        assert_eq!(verdict, ReplicationVerdict::MissingCounter);

        let verdict = evaluate(&StatusCodeClassifier, PREFIX, &path, "PUT", &responses(&[200, 404, 500]));
        assert!(matches!(verdict, ReplicationVerdict::Disconnect(nodes) if nodes.len() == 2));
    }

    #[test]
    fn test_no_failures() {
        let verdict = evaluate(&StatusCodeClassifier, PREFIX, "/x", "DELETE", &responses(&[200, 204]));
        assert_eq!(verdict, ReplicationVerdict::NoFailures);
    }
}

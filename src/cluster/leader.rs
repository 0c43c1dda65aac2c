//! Leader-election integration
//!
//! The coordinator never elects anyone itself. It asks an external election
//! service who holds a role and whether this process holds it.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// Roles handed out by the election service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElectableRole {
    ClusterCoordinator,
    PrimaryNode,
}

impl fmt::Display for ElectableRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectableRole::ClusterCoordinator => write!(f, "Cluster Coordinator"),
            ElectableRole::PrimaryNode => write!(f, "Primary Node"),
        }
    }
}

/// Client of the external leader-election service
#[async_trait]
pub trait LeaderReference: Send + Sync {
    /// `host:port` of the current holder of `role`
    ///
    /// `Ok(None)` and `Err(ClusterError::NoLeader)` both mean nobody holds the
    /// role right now.
    async fn leader(&self, role: ElectableRole) -> ClusterResult<Option<String>>;

    /// Whether this process currently holds `role`
    fn is_leader(&self, role: ElectableRole) -> bool;
}

/// Split a leader address into host and port
pub fn parse_leader_address(address: &str) -> ClusterResult<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ClusterError::InvalidLeaderAddress(address.to_string()))?;
    if host.is_empty() {
        return Err(ClusterError::InvalidLeaderAddress(address.to_string()));
    }
    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|_| ClusterError::InvalidLeaderAddress(address.to_string()))?;
    Ok((host.to_string(), port))
}

/// Leader reference backed by fixed, updatable assignments
///
/// Used by single-node deployments and tests. `local_address` is compared
/// against the assignment to answer [`LeaderReference::is_leader`].
#[derive(Debug)]
pub struct StaticLeaderReference {
    local_address: String,
    assignments: RwLock<HashMap<ElectableRole, String>>,
}

impl StaticLeaderReference {
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// A reference in which this process holds every role
    pub fn self_elected(local_address: impl Into<String>) -> Self {
        let local_address = local_address.into();
        let reference = Self::new(local_address.clone());
        reference.assign(ElectableRole::ClusterCoordinator, Some(local_address.clone()));
        reference.assign(ElectableRole::PrimaryNode, Some(local_address));
        reference
    }

    pub fn assign(&self, role: ElectableRole, address: Option<String>) {
        let mut assignments = self.assignments.write();
        match address {
            Some(address) => {
                assignments.insert(role, address);
            }
            None => {
                assignments.remove(&role);
            }
        }
    }
}

#[async_trait]
impl LeaderReference for StaticLeaderReference {
    async fn leader(&self, role: ElectableRole) -> ClusterResult<Option<String>> {
        Ok(self.assignments.read().get(&role).cloned())
    }

    fn is_leader(&self, role: ElectableRole) -> bool {
        self.assignments
            .read()
            .get(&role)
            .map(|address| address == &self.local_address)
            .unwrap_or(false)
    }
}

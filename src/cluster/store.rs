//! Connection status store
//!
//! Concurrent map from node id to the node's latest [`NodeConnectionStatus`],
//! plus each node's event history. Atomicity contracts:
//!
//! - `put` is unconditional last-write-wins and is meant for authoritative
//!   local decisions.
//! - `replace`, `reset_status` and `reset_all` are per-key compare-and-swap
//!   operations used where a concurrently arrived update must not be clobbered.
//! - A status in the `Removed` state is never stored; applying one deletes the
//!   entry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::events::{NodeEvent, NodeEventLog};
use crate::types::{NodeConnectionState, NodeConnectionStatus, NodeIdentity, Severity};

/// Process-wide source of update identifiers
///
/// Locally minted ids are always greater than any id observed from a peer.
#[derive(Debug)]
pub struct UpdateIdGenerator {
    next: AtomicU64,
}

impl UpdateIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Advance past an id seen locally or on the wire
    pub fn observe(&self, update_id: u64) {
        self.next.fetch_max(update_id.saturating_add(1), Ordering::SeqCst);
    }

    /// The id the next call to `next_id` will return
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for UpdateIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrent store of node connection statuses
#[derive(Debug)]
pub struct ConnectionStatusStore {
    statuses: DashMap<String, NodeConnectionStatus>,
    events: DashMap<String, Arc<NodeEventLog>>,
    /// Update id at which a node was last removed
    tombstones: DashMap<String, u64>,
    update_ids: UpdateIdGenerator,
    event_capacity: usize,
}

impl ConnectionStatusStore {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            statuses: DashMap::new(),
            events: DashMap::new(),
            tombstones: DashMap::new(),
            update_ids: UpdateIdGenerator::new(),
            event_capacity,
        }
    }

    pub fn next_update_id(&self) -> u64 {
        self.update_ids.next_id()
    }

    pub fn observe_update_id(&self, update_id: u64) {
        self.update_ids.observe(update_id);
    }

    pub fn update_ids(&self) -> &UpdateIdGenerator {
        &self.update_ids
    }

    pub fn get(&self, node_id: &str) -> Option<NodeConnectionStatus> {
        self.statuses.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn state_of(&self, node_id: &str) -> Option<NodeConnectionState> {
        self.statuses.get(node_id).map(|entry| entry.value().state)
    }

    /// Unconditionally apply a status, returning the one it replaced
    pub fn put(&self, status: NodeConnectionStatus) -> Option<NodeConnectionStatus> {
        let node_id = status.node_id().to_string();
        match self.statuses.entry(node_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if status.state == NodeConnectionState::Removed {
                    self.record_tombstone(&node_id, status.update_id);
                    Some(occupied.remove())
                } else {
                    self.tombstones.remove(&node_id);
                    Some(occupied.insert(status))
                }
            }
            Entry::Vacant(vacant) => {
                if status.state == NodeConnectionState::Removed {
                    self.record_tombstone(&node_id, status.update_id);
                } else {
                    self.tombstones.remove(&node_id);
                    vacant.insert(status);
                }
                None
            }
        }
    }

    /// Apply `status` only if the current entry equals `expected`
    ///
    /// `expected == None` means the node must currently be absent. An applied
    /// removal also drops the node's event history.
    pub fn replace(
        &self,
        node_id: &str,
        expected: Option<&NodeConnectionStatus>,
        status: NodeConnectionStatus,
    ) -> bool {
        let removing = status.state == NodeConnectionState::Removed;
        let applied = self.swap_if(node_id, expected, status);
        if applied && removing {
            self.clear_events(node_id);
        }
        applied
    }

    fn swap_if(
        &self,
        node_id: &str,
        expected: Option<&NodeConnectionStatus>,
        status: NodeConnectionStatus,
    ) -> bool {
        match self.statuses.entry(node_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected != Some(occupied.get()) {
                    return false;
                }
                if status.state == NodeConnectionState::Removed {
                    self.record_tombstone(node_id, status.update_id);
                    occupied.remove();
                } else {
                    occupied.insert(status);
                }
                true
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return false;
                }
                if status.state == NodeConnectionState::Removed {
                    self.record_tombstone(node_id, status.update_id);
                } else {
                    vacant.insert(status);
                }
                true
            }
        }
    }

    /// Insert `status` unless the node is already known
    ///
    /// Returns the existing status when one was present.
    pub fn insert_if_absent(&self, status: NodeConnectionStatus) -> Option<NodeConnectionStatus> {
        match self.statuses.entry(status.node_id().to_string()) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(status);
                None
            }
        }
    }

    /// Remember a status learned out of band (e.g. by asking a node directly)
    ///
    /// Never overwrites a known node, and refuses to bring back a removed
    /// node unless the learned status is newer than its removal. The
    /// tombstone is read under the same entry lock that removals write it
    /// under.
    pub fn memoize(&self, status: NodeConnectionStatus) -> Option<NodeConnectionStatus> {
        match self.statuses.entry(status.node_id().to_string()) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let fenced = self
                    .tombstones
                    .get(status.node_id())
                    .map_or(false, |removed_at| status.update_id <= *removed_at);
                if fenced {
                    return None;
                }
                vacant.insert(status.clone());
                Some(status)
            }
        }
    }

    /// Delete a node's entry and history
    pub fn remove(&self, node_id: &str) -> Option<NodeConnectionStatus> {
        let previous = match self.statuses.entry(node_id.to_string()) {
            Entry::Occupied(occupied) => {
                self.record_tombstone(node_id, occupied.get().update_id);
                Some(occupied.remove())
            }
            Entry::Vacant(_) => {
                self.record_tombstone(node_id, self.update_ids.peek());
                None
            }
        };
        self.clear_events(node_id);
        previous
    }

    /// Apply `status` iff the stored update id equals `qualifying_update_id`
    ///
    /// An unknown node is inserted as long as it is still unknown.
    pub fn reset_status(&self, status: NodeConnectionStatus, qualifying_update_id: u64) -> bool {
        let removing = status.state == NodeConnectionState::Removed;
        let node_id = status.node_id().to_string();
        let update_id = status.update_id;
        match self.statuses.entry(node_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().update_id != qualifying_update_id {
                    return false;
                }
                if removing {
                    self.record_tombstone(&node_id, update_id);
                    occupied.remove();
                } else {
                    occupied.insert(status);
                }
            }
            Entry::Vacant(vacant) => {
                if removing {
                    self.record_tombstone(&node_id, update_id);
                } else {
                    vacant.insert(status);
                }
            }
        }
        self.update_ids.observe(update_id);
        true
    }

    /// Reconcile with a full snapshot received from a peer
    ///
    /// Each entry applies when the node is unknown or the incoming update id is
    /// at least the stored one. Returns the number of entries applied.
    pub fn reset_all<I>(&self, statuses: I) -> usize
    where
        I: IntoIterator<Item = NodeConnectionStatus>,
    {
        let mut applied = 0;
        for status in statuses {
            self.update_ids.observe(status.update_id);
            let removing = status.state == NodeConnectionState::Removed;
            let node_id = status.node_id().to_string();
            let update_id = status.update_id;
            match self.statuses.entry(node_id.clone()) {
                Entry::Occupied(mut occupied) => {
                    if update_id < occupied.get().update_id {
                        continue;
                    }
                    if removing {
                        self.record_tombstone(&node_id, update_id);
                        occupied.remove();
                    } else {
                        occupied.insert(status);
                    }
                    applied += 1;
                }
                Entry::Vacant(vacant) => {
                    // Removing an absent node changes nothing but still fences it
                    if removing {
                        self.record_tombstone(&node_id, update_id);
                    } else {
                        vacant.insert(status);
                        applied += 1;
                    }
                }
            }
        }
        applied
    }

    /// All statuses, ordered by node id
    pub fn all(&self) -> Vec<NodeConnectionStatus> {
        let mut statuses: Vec<_> = self.statuses.iter().map(|e| e.value().clone()).collect();
        statuses.sort_by(|a, b| a.node_id().cmp(b.node_id()));
        statuses
    }

    /// Identities of nodes in any of `states`; an empty filter matches all
    pub fn identities(&self, states: &[NodeConnectionState]) -> HashSet<NodeIdentity> {
        self.statuses
            .iter()
            .filter(|e| states.is_empty() || states.contains(&e.value().state))
            .map(|e| e.value().identity.clone())
            .collect()
    }

    /// Look a node up by its full id or an unambiguous fragment of it
    pub fn find_by_uuid(&self, fragment: &str) -> Option<NodeIdentity> {
        if fragment.is_empty() {
            return None;
        }
        if let Some(entry) = self.statuses.get(fragment) {
            return Some(entry.value().identity.clone());
        }
        let mut matches = self
            .statuses
            .iter()
            .filter(|e| e.key().contains(fragment))
            .map(|e| e.value().identity.clone());
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }

    pub fn add_event(&self, node_id: &str, severity: Severity, message: impl Into<String>) {
        let log = self
            .events
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(NodeEventLog::new(self.event_capacity)))
            .value()
            .clone();
        log.push(NodeEvent::new(node_id, severity, message));
    }

    pub fn events(&self, node_id: &str) -> Vec<NodeEvent> {
        self.events
            .get(node_id)
            .map(|log| log.value().snapshot())
            .unwrap_or_default()
    }

    pub fn clear_events(&self, node_id: &str) {
        self.events.remove(node_id);
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    fn record_tombstone(&self, node_id: &str, update_id: u64) {
        let mut tombstone = self.tombstones.entry(node_id.to_string()).or_insert(0);
        if *tombstone < update_id {
            *tombstone = update_id;
        }
    }
}

//! Per-node event history
//!
//! Each node keeps a small ring buffer of human readable events. The history
//! is diagnostic only and takes no part in state propagation.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::Severity;

/// A diagnostic event recorded against a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node_id: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl NodeEvent {
    pub fn new(node_id: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }
}

/// Fixed-capacity event log, oldest entries evicted first
#[derive(Debug)]
pub struct NodeEventLog {
    capacity: usize,
    events: Mutex<VecDeque<NodeEvent>>,
}

impl NodeEventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, event: NodeEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Events in the order they were recorded
    pub fn snapshot(&self) -> Vec<NodeEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

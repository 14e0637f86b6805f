//! Event types for branch notifications.

use crate::refs::Ref;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct EventConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: EventFilter,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: EventFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only events touching these nodes (None = all nodes).
    pub node_ids: Option<Vec<NodeId>>,

    /// Include commit events.
    pub include_commits: bool,

    /// Include structural events (create, rebase, merge, delete).
    pub include_structure: bool,
}

impl EventFilter {
    /// Subscribe to everything.
    pub fn all() -> Self {
        Self {
            node_ids: None,
            include_commits: true,
            include_structure: true,
        }
    }

    /// Subscribe to structural changes only.
    pub fn structure() -> Self {
        Self {
            include_structure: true,
            ..Default::default()
        }
    }

    /// Subscribe to everything that touches the given nodes.
    pub fn nodes(node_ids: Vec<NodeId>) -> Self {
        Self {
            node_ids: Some(node_ids),
            ..Self::all()
        }
    }
}

/// Events emitted by the branch manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BranchEvent {
    /// A new branch table was created.
    BranchCreated { node_id: NodeId, base_ref: Ref },

    /// A commit was written to a branch.
    CommitWritten {
        node_id: NodeId,
        count: u64,
        conflicting: u64,
    },

    /// A branch was replayed onto a new base.
    Rebased {
        node_id: NodeId,
        new_node_id: NodeId,
        base_ref: Ref,
        conflicting: bool,
    },

    /// A merge stopped on conflicts; they wait in the temporary branch.
    MergePaused {
        source_node_id: NodeId,
        tmp_node_id: NodeId,
        merge_ref: Ref,
    },

    /// A merge was folded into its target.
    Merged {
        source_node_id: NodeId,
        target_node_id: NodeId,
        merge_ref: Ref,
    },

    /// A branch table was dropped.
    BranchDeleted { node_id: NodeId },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl BranchEvent {
    /// Nodes this event is about.
    pub fn node_ids(&self) -> Vec<NodeId> {
        match self {
            BranchEvent::BranchCreated { node_id, .. }
            | BranchEvent::CommitWritten { node_id, .. }
            | BranchEvent::BranchDeleted { node_id } => vec![*node_id],
            BranchEvent::Rebased {
                node_id, new_node_id, ..
            } => vec![*node_id, *new_node_id],
            BranchEvent::MergePaused {
                source_node_id,
                tmp_node_id,
                ..
            } => vec![*source_node_id, *tmp_node_id],
            BranchEvent::Merged {
                source_node_id,
                target_node_id,
                ..
            } => vec![*source_node_id, *target_node_id],
            BranchEvent::Dropped { .. } => Vec::new(),
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, BranchEvent::CommitWritten { .. })
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<BranchEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<BranchEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<BranchEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<BranchEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<BranchEvent> {
        self.receiver.try_iter().collect()
    }
}

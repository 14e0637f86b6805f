//! Event bus broadcasting branch events.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::types::{BranchEvent, DropReason, EventConfig, SubscriptionHandle, SubscriptionId};

/// Internal subscription state.
struct Subscription {
    config: EventConfig,
    sender: Sender<BranchEvent>,
}

impl Subscription {
    /// Try to send an event. Returns false if buffer is full (subscriber will be dropped).
    fn try_send(&self, event: BranchEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn matches(&self, event: &BranchEvent) -> bool {
        let filter = &self.config.filter;
        let wanted = if event.is_commit() {
            filter.include_commits
        } else {
            filter.include_structure
        };
        if !wanted {
            return false;
        }

        match &filter.node_ids {
            Some(ids) => event.node_ids().iter().any(|n| ids.contains(n)),
            None => true,
        }
    }
}

/// Manages subscriptions and broadcasts events.
pub struct EventBus {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Buffer size used by [`EventBus::subscribe_default`].
    default_buffer_size: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer_size(EventConfig::default().buffer_size)
    }

    /// Bus whose default subscriptions buffer `buffer_size` events.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_buffer_size: buffer_size.max(1),
        }
    }

    /// Create a new subscription.
    pub fn subscribe(&self, config: EventConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        SubscriptionHandle { id, receiver }
    }

    /// Subscribe to all events with the bus's default buffer size.
    pub fn subscribe_default(&self) -> SubscriptionHandle {
        self.subscribe(EventConfig {
            buffer_size: self.default_buffer_size,
            ..Default::default()
        })
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.write();
        if let Some(sub) = subs.remove(&id) {
            let _ = sub.sender.try_send(BranchEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Send an event to every matching subscriber. Drops subscribers that fail to receive.
    pub fn publish(&self, event: BranchEvent) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            if subs.is_empty() {
                return;
            }
            for (id, sub) in subs.iter() {
                if sub.matches(&event) && !sub.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    debug!(subscription = id.0, "Dropping slow subscriber");
                    let _ = sub.sender.try_send(BranchEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

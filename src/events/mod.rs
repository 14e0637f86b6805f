//! In-process notifications about branch changes.
//!
//! Hosts that cache anything derived from the branch tree (resolved refs,
//! table chains, rendered tiles) subscribe here and invalidate on
//! structural events. Subscribers get bounded buffers; a slow subscriber is
//! dropped instead of slowing down the writer.
//!
//! # Example
//!
//! ```ignore
//! let handle = context.events().subscribe(EventConfig {
//!     filter: EventFilter::structure(),
//!     ..Default::default()
//! });
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         BranchEvent::BranchDeleted { node_id } => cache.evict(node_id),
//!         BranchEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::EventBus;
pub use types::{BranchEvent, DropReason, EventConfig, EventFilter, SubscriptionHandle, SubscriptionId};

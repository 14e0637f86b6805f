//! # Space Branching
//!
//! Git-like versioning for feature collections ("spaces") stored in plain
//! relational tables: fork a space, commit to branches independently, rebase
//! them and merge them back.
//!
//! ## Core Concepts
//!
//! - **Branches**: one physical table per branch; the table name encodes the
//!   ref the branch was forked from
//! - **Refs**: `~<node>:<version>`, `~<node>` (HEAD), ranges for history
//! - **Commits**: batches of feature modifications written at one version
//! - **History**: paged changesets, replayed by rebase and merge
//!
//! The engine never issues SQL itself. Everything it needs from the store goes
//! through the traits in [`backend`]; [`MemoryBackend`] implements all of them
//! in-process.
//!
//! ## Example
//!
//! ```ignore
//! use space_branching::{BranchManager, EngineConfig, MemoryBackend, Modification, Feature, Ref};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! backend.create_space("public", "space")?;
//! let branches = BranchManager::open(backend, EngineConfig::for_space("public", "space"))?;
//!
//! // Fork main at HEAD and commit to the fork
//! let fork = branches.create_branch(&Ref::head())?;
//! let node = fork.node_id()?;
//! branches.write_commit(node, vec![Modification::write(vec![Feature::new("f1")])], "alice", &Ref::head(), None)?;
//!
//! // Fold it back into main
//! let merged = branches.merge(node, &branches.base_ref(node)?, 0, false)?;
//! assert!(!merged.conflicting);
//! ```

pub mod backend;
pub mod branches;
pub mod commits;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod history;
pub mod lineage;
pub mod naming;
pub mod refs;
pub mod types;

// Re-exports
pub use backend::{
    Backend, ChangesetPage, ChangesetQuery, ChangesetSource, FeatureWriter, MemoryBackend,
    SequenceStore, TableCatalog, TableSpec, WriteRequest,
};
pub use branches::{BranchManager, PruneResult};
pub use commits::{CommitManager, TableChain};
pub use config::EngineConfig;
pub use context::EngineContext;
pub use error::{BackendError, BackendResult, EngineError, Result};
pub use events::{
    BranchEvent, DropReason, EventBus, EventConfig, EventFilter, SubscriptionHandle, SubscriptionId,
};
pub use history::{ChangesetIterator, HistoryManager};
pub use lineage::LineageIndex;
pub use naming::BranchTableName;
pub use refs::{BranchRef, Ref, RefVersion};
pub use types::*;

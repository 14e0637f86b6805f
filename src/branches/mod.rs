//! Branch topology and the replay algorithms built on it.
//!
//! A branch is one physical table whose name encodes the ref it was forked
//! from. Rebase and merge are expressed as replays of changesets on top of
//! another branch, through the commit and history managers.

mod ancestry;
mod manager;

pub use manager::{BranchManager, PruneResult};

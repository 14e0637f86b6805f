//! History: version-ordered changesets of a branch range.
//!
//! The changeset source pages its results. [`ChangesetIterator`] hides the
//! paging but not its artefact: one changeset may arrive as several
//! fragments with the same version. Consumers that need whole changesets
//! fold adjacent fragments ([`HistoryManager::collect_logical`] does that).

mod iterator;
mod manager;

pub use iterator::ChangesetIterator;
pub use manager::HistoryManager;

//! Branch lineage.
//!
//! The catalog's table names are the source of truth for which node is based
//! on which ref. [`LineageIndex`] keeps them decoded in memory so that path
//! and base lookups do not hit the catalog every time.

mod index;

pub use index::LineageIndex;

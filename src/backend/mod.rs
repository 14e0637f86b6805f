//! Backing store collaborators.
//!
//! The engine never talks SQL. Everything it needs from the relational store
//! goes through four narrow traits:
//!
//! - [`TableCatalog`]: list, create and drop physical tables
//! - [`SequenceStore`]: `nextval` / `setval` style counters
//! - [`FeatureWriter`]: apply a batch of modifications along a table chain
//! - [`ChangesetSource`]: page through committed changesets
//!
//! [`Backend`] bundles them. [`MemoryBackend`] is an in-process
//! implementation of all four.

mod memory;
mod snapshot;

pub use memory::MemoryBackend;

use crate::error::BackendResult;
use crate::refs::Ref;
use crate::types::{Changeset, Modification, NodeId};
use serde_json::Value;

/// Physical layout of a new branch table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSpec {
    pub space_id: String,
    /// Number of partitions (None = unpartitioned).
    pub partitions: Option<u32>,
}

/// Catalog of physical tables.
pub trait TableCatalog: Send + Sync {
    /// Names of all tables in a schema.
    fn list_tables(&self, schema: &str) -> BackendResult<Vec<String>>;

    /// Create a branch table together with its version sequence.
    fn create_table(&self, schema: &str, table: &str, spec: &TableSpec) -> BackendResult<()>;

    /// Drop a table, its partitions and its sequences. No-op if missing.
    fn drop_table(&self, schema: &str, table: &str) -> BackendResult<()>;

    /// Highest version stored in a table, 0 when empty.
    fn max_version(&self, schema: &str, table: &str) -> BackendResult<u64>;
}

/// Atomic per-table counters.
pub trait SequenceStore: Send + Sync {
    /// Increment the sequence and return the new value.
    fn next_value(&self, schema: &str, sequence: &str) -> BackendResult<u64>;

    /// Set the sequence so that the next `next_value` returns `value + 1`.
    fn set_value(&self, schema: &str, sequence: &str, value: u64) -> BackendResult<()>;
}

/// Input of one feature-writer call.
#[derive(Clone, Debug)]
pub struct WriteRequest {
    pub schema: String,

    /// Table chain, root first, ending at the table written to.
    pub tables: Vec<String>,

    /// Base version of each table of the chain (0 for the root).
    pub table_base_versions: Vec<u64>,

    pub modifications: Vec<Modification>,
    pub author: String,

    /// Version the writer checks conflicts against (None = writer default).
    pub base_version: Option<u64>,

    /// Absolute version to write (None = next value of the table's sequence).
    pub version: Option<u64>,

    /// First version written by the replay this request belongs to. Rows of
    /// the target table from that version up to `version` are the replay's
    /// own output and never count as conflicts. None for plain commits.
    pub replay_floor: Option<u64>,

    pub history_enabled: bool,
    pub batch_mode: bool,
}

/// Applies modifications to the last table of a chain.
pub trait FeatureWriter: Send + Sync {
    /// Returns the writer's result rows. A well-behaved writer returns exactly
    /// one row of the form `{"count": n, "conflicting": m}`.
    fn write_features(&self, request: &WriteRequest) -> BackendResult<Vec<Value>>;
}

/// Input of one changeset page request.
#[derive(Clone, Debug)]
pub struct ChangesetQuery {
    pub schema: String,
    pub root_table: String,
    pub space_id: String,

    /// `<endBranch>:<startVersion>..<endVersion|HEAD>`; start exclusive.
    pub range: Ref,

    /// Base refs leading from the start node to the end node.
    pub branch_path: Vec<Ref>,

    pub page_size: usize,
    pub page_token: Option<String>,
    pub node_id: NodeId,

    /// Oldest version the caller expects to still be retained.
    pub min_version: Option<u64>,
}

/// One page of changesets.
#[derive(Clone, Debug, Default)]
pub struct ChangesetPage {
    pub changesets: Vec<Changeset>,
    pub next_page_token: Option<String>,
}

/// Pages through committed changesets.
pub trait ChangesetSource: Send + Sync {
    fn query_changesets(&self, query: &ChangesetQuery) -> BackendResult<ChangesetPage>;
}

/// Everything the engine needs from a backing store.
pub trait Backend: TableCatalog + SequenceStore + FeatureWriter + ChangesetSource {}

impl<T> Backend for T where T: TableCatalog + SequenceStore + FeatureWriter + ChangesetSource {}

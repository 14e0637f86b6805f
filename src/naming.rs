//! Physical table naming contract.
//!
//! Branch tables are named `<root>_<baseNodeId>_<baseVersion>_<nodeId>`; the
//! main branch's table is `<root>` itself. The names are the source of truth
//! for lineage, so encoding and decoding must stay bit-exact.

use crate::refs::Ref;
use crate::types::{NodeId, MAIN_NODE_ID};

/// Sequence kind of a branch table's version counter.
pub const VERSION_SEQUENCE: &str = "version";

/// Sequence kind of the root table's branch counter.
pub const BRANCH_SEQUENCE: &str = "branches";

/// Lineage decoded from a branch table name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BranchTableName {
    pub base_node_id: NodeId,
    pub base_version: u64,
    pub node_id: NodeId,
}

impl BranchTableName {
    /// Base ref encoded in the name.
    pub fn base_ref(&self) -> Ref {
        Ref::node(self.base_node_id, self.base_version)
    }
}

/// Table name of a branch forked from `base_node_id` at `base_version`.
pub fn branch_table_name(root_table: &str, base_node_id: NodeId, base_version: u64, node_id: NodeId) -> String {
    format!("{}_{}_{}_{}", root_table, base_node_id, base_version, node_id)
}

/// Decode a table name of the given root.
///
/// Returns `None` for the root table itself, for partitions of branch tables
/// and for any other table that does not follow the convention exactly.
pub fn parse_branch_table_name(root_table: &str, table_name: &str) -> Option<BranchTableName> {
    let suffix = table_name.strip_prefix(root_table)?.strip_prefix('_')?;
    let mut parts = suffix.split('_');
    let base_node_id = parse_segment(parts.next()?)?;
    let base_version = parse_segment(parts.next()?)?;
    let node_id = parse_segment(parts.next()?)?;
    if parts.next().is_some() || node_id == MAIN_NODE_ID {
        return None;
    }
    Some(BranchTableName {
        base_node_id,
        base_version,
        node_id,
    })
}

/// Name of the sequence of the given kind owned by a table.
pub fn sequence_name(table_name: &str, kind: &str) -> String {
    format!("{}_{}_seq", table_name, kind)
}

/// Name of the `index`-th partition of a table.
pub fn partition_name(table_name: &str, index: u32) -> String {
    format!("{}_p{}", table_name, index)
}

/// True for plain identifiers that are safe as a root table name.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_segment<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

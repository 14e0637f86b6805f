//! Node id → base/table map mirroring the catalog.

use crate::error::{EngineError, Result};
use crate::naming::{branch_table_name, parse_branch_table_name, BranchTableName};
use crate::refs::Ref;
use crate::types::{NodeId, MAIN_NODE_ID};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

/// In-memory lineage of all branches of one root table.
///
/// Entries are decoded from table names, so the index can always be rebuilt
/// from a catalog listing. Resolved branch paths are memoised and dropped on
/// every structural change.
pub struct LineageIndex {
    root_table: String,

    /// Lineage by node id (main has no entry).
    entries: RwLock<HashMap<NodeId, BranchTableName>>,

    /// Resolved paths by (start node, end node).
    paths: Mutex<LruCache<(NodeId, NodeId), Vec<Ref>>>,
}

impl LineageIndex {
    pub fn new(root_table: impl Into<String>, path_cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(path_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            root_table: root_table.into(),
            entries: RwLock::new(HashMap::new()),
            paths: Mutex::new(LruCache::new(cache_size)),
        }
    }

    pub fn root_table(&self) -> &str {
        &self.root_table
    }

    /// Replace all entries with the branch tables found in `table_names`.
    ///
    /// Names that are not branch tables of this root are ignored. Returns the
    /// number of branches found.
    pub fn rebuild<I, S>(&self, table_names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries: HashMap<NodeId, BranchTableName> = table_names
            .into_iter()
            .filter_map(|name| parse_branch_table_name(&self.root_table, name.as_ref()))
            .map(|decoded| (decoded.node_id, decoded))
            .collect();
        let count = entries.len();

        *self.entries.write() = entries;
        self.paths.lock().clear();
        count
    }

    pub fn get(&self, node_id: NodeId) -> Option<BranchTableName> {
        self.entries.read().get(&node_id).copied()
    }

    pub fn insert(&self, entry: BranchTableName) {
        self.entries.write().insert(entry.node_id, entry);
        self.paths.lock().clear();
    }

    pub fn remove(&self, node_id: NodeId) -> Option<BranchTableName> {
        let removed = self.entries.write().remove(&node_id);
        self.paths.lock().clear();
        removed
    }

    /// Physical table name of an entry.
    pub fn table_name(&self, entry: &BranchTableName) -> String {
        branch_table_name(&self.root_table, entry.base_node_id, entry.base_version, entry.node_id)
    }

    /// Nodes directly based on `node_id`.
    pub fn children(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut children: Vec<NodeId> = self
            .entries
            .read()
            .values()
            .filter(|e| e.base_node_id == node_id)
            .map(|e| e.node_id)
            .collect();
        children.sort_unstable();
        children
    }

    /// All known branch nodes, ascending.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.entries.read().keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Base refs leading from `start` to `node_id`, earliest first.
    ///
    /// Walks up from `node_id` until `start` or main is reached. `resolve`
    /// is asked for every node on the way; it decides what a miss means.
    pub fn path<F>(&self, start: NodeId, node_id: NodeId, mut resolve: F) -> Result<Vec<Ref>>
    where
        F: FnMut(NodeId) -> Result<BranchTableName>,
    {
        if let Some(path) = self.paths.lock().get(&(start, node_id)) {
            return Ok(path.clone());
        }

        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut current = node_id;

        while current != start && current != MAIN_NODE_ID {
            if !visited.insert(current) {
                return Err(EngineError::InvalidArgument(format!(
                    "Branch lineage of node {} contains a cycle at node {}",
                    node_id, current
                )));
            }
            let entry = resolve(current)?;
            path.push(entry.base_ref());
            current = entry.base_node_id;
        }
        path.reverse();

        self.paths.lock().put((start, node_id), path.clone());
        Ok(path)
    }
}

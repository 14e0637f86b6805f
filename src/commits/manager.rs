//! Commit manager implementation.

use crate::backend::WriteRequest;
use crate::context::EngineContext;
use crate::error::{BackendError, Result};
use crate::events::BranchEvent;
use crate::types::{CommitResult, Modification, NodeId, MAIN_NODE_ID};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Ordered physical tables a write into a node has to consult.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableChain {
    /// Root table first, the node's own table last.
    pub tables: Vec<String>,
    /// Base version of each table (0 for the root).
    pub base_versions: Vec<u64>,
}

impl TableChain {
    /// Table written to.
    pub fn target(&self) -> Option<&str> {
        self.tables.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Hands batches of modifications to the feature writer.
pub struct CommitManager {
    context: Arc<EngineContext>,
}

impl CommitManager {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    /// Table chain of a node: the tables of every base on its path, then its own.
    pub fn table_chain(&self, node_id: NodeId) -> Result<TableChain> {
        let path = self.context.branch_path(MAIN_NODE_ID, node_id)?;

        let mut tables = Vec::with_capacity(path.len() + 1);
        let mut base_versions = Vec::with_capacity(path.len() + 1);

        // Every base ref's node contributes its table, with its own base version.
        for base_ref in &path {
            let base_node = base_ref.node_id()?;
            tables.push(self.context.table_name(base_node)?);
            base_versions.push(self.context.base_version(base_node)?);
        }

        tables.push(self.context.table_name(node_id)?);
        base_versions.push(match path.last() {
            Some(base_ref) => base_ref.require_version()?,
            None => 0,
        });

        Ok(TableChain {
            tables,
            base_versions,
        })
    }

    /// Write `modifications` into `node_id`.
    ///
    /// `base_version` is the version the caller's changes are based on (None
    /// leaves the writer's own default). `version` pins the absolute version
    /// of the commit; otherwise the node's version sequence assigns it.
    pub fn write_commit(
        &self,
        node_id: NodeId,
        modifications: Vec<Modification>,
        author: &str,
        base_version: Option<u64>,
        version: Option<u64>,
    ) -> Result<CommitResult> {
        self.write(node_id, modifications, author, base_version, version, None)
    }

    /// Write one replayed changeset at `version`.
    ///
    /// `replay_floor` is the first version the replay wrote into this node;
    /// earlier changesets of the same replay are not conflicts for later ones.
    pub fn replay_commit(
        &self,
        node_id: NodeId,
        modifications: Vec<Modification>,
        author: &str,
        base_version: u64,
        version: u64,
        replay_floor: u64,
    ) -> Result<CommitResult> {
        self.write(
            node_id,
            modifications,
            author,
            Some(base_version),
            Some(version),
            Some(replay_floor),
        )
    }

    fn write(
        &self,
        node_id: NodeId,
        modifications: Vec<Modification>,
        author: &str,
        base_version: Option<u64>,
        version: Option<u64>,
        replay_floor: Option<u64>,
    ) -> Result<CommitResult> {
        let chain = self.table_chain(node_id)?;

        let request = WriteRequest {
            schema: self.context.schema().to_string(),
            tables: chain.tables,
            table_base_versions: chain.base_versions,
            modifications,
            author: author.to_string(),
            base_version,
            version,
            replay_floor,
            history_enabled: true,
            batch_mode: true,
        };

        let rows = self.context.backend().write_features(&request)?;
        let result = parse_result(&rows)?;

        debug!(
            node_id,
            ?base_version,
            ?version,
            ?replay_floor,
            count = result.count,
            conflicting = result.conflicting,
            "Wrote commit"
        );
        self.context.events().publish(BranchEvent::CommitWritten {
            node_id,
            count: result.count,
            conflicting: result.conflicting,
        });

        Ok(result)
    }
}

/// The writer's single result row as a [`CommitResult`].
fn parse_result(rows: &[Value]) -> Result<CommitResult> {
    let row = rows.first().ok_or_else(|| {
        BackendError::Protocol("Feature writer returned no result row".into())
    })?;
    serde_json::from_value(row.clone()).map_err(|e| {
        BackendError::Protocol(format!("Unreadable feature writer result {}: {}", row, e)).into()
    })
}

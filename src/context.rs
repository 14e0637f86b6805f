//! Shared state of one versioned space.

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::error::{BackendError, Result};
use crate::events::EventBus;
use crate::lineage::LineageIndex;
use crate::naming::BranchTableName;
use crate::refs::Ref;
use crate::types::{NodeId, MAIN_NODE_ID};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;
use tracing::debug;

/// Everything the branch, commit and history managers share.
///
/// Build one per space and hand it to the managers by `Arc`. The structural
/// lock only serialises managers that share the same context.
pub struct EngineContext {
    backend: Arc<dyn Backend>,
    config: EngineConfig,
    lineage: LineageIndex,
    structure_lock: ReentrantMutex<()>,
    events: EventBus,
}

impl EngineContext {
    /// Validate `config` and load the lineage of its root table.
    pub fn new(backend: Arc<dyn Backend>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let context = Self {
            lineage: LineageIndex::new(config.root_table.clone(), config.path_cache_size),
            events: EventBus::with_buffer_size(config.event_buffer_size),
            structure_lock: ReentrantMutex::new(()),
            backend,
            config,
        };
        context.refresh_lineage()?;
        Ok(context)
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn schema(&self) -> &str {
        &self.config.schema
    }

    pub fn root_table(&self) -> &str {
        &self.config.root_table
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn lineage(&self) -> &LineageIndex {
        &self.lineage
    }

    /// Serialise structural changes of this space. Re-entrant.
    pub(crate) fn lock_structure(&self) -> ReentrantMutexGuard<'_, ()> {
        self.structure_lock.lock()
    }

    /// Re-read the lineage from the catalog.
    pub fn refresh_lineage(&self) -> Result<usize> {
        let tables = self.backend.list_tables(&self.config.schema)?;
        let count = self.lineage.rebuild(&tables);
        debug!(
            schema = %self.config.schema,
            root_table = %self.config.root_table,
            branches = count,
            "Refreshed lineage"
        );
        Ok(count)
    }

    /// Lineage of a branch node, re-reading the catalog once on a miss.
    pub fn lineage_entry(&self, node_id: NodeId) -> Result<BranchTableName> {
        if node_id != MAIN_NODE_ID {
            if let Some(entry) = self.lineage.get(node_id) {
                return Ok(entry);
            }
            self.refresh_lineage()?;
            if let Some(entry) = self.lineage.get(node_id) {
                return Ok(entry);
            }
        }
        Err(BackendError::TableNotFound(node_id).into())
    }

    /// Physical table of a node; main's table is the root table.
    pub fn table_name(&self, node_id: NodeId) -> Result<String> {
        if node_id == MAIN_NODE_ID {
            return Ok(self.config.root_table.clone());
        }
        let entry = self.lineage_entry(node_id)?;
        Ok(self.lineage.table_name(&entry))
    }

    /// Base ref of a branch node.
    pub fn base_ref(&self, node_id: NodeId) -> Result<Ref> {
        Ok(self.lineage_entry(node_id)?.base_ref())
    }

    /// Base version of a node; 0 for main.
    pub fn base_version(&self, node_id: NodeId) -> Result<u64> {
        if node_id == MAIN_NODE_ID {
            return Ok(0);
        }
        Ok(self.lineage_entry(node_id)?.base_version)
    }

    /// Base refs connecting `start` to `node_id`, earliest first.
    pub fn branch_path(&self, start: NodeId, node_id: NodeId) -> Result<Vec<Ref>> {
        self.lineage
            .path(start, node_id, |node| self.lineage_entry(node))
    }
}

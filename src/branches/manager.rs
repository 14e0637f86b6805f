//! Branch manager implementation.

use super::ancestry::common_ancestor;
use crate::backend::{Backend, TableSpec};
use crate::commits::CommitManager;
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::{BackendError, EngineError, Result};
use crate::events::BranchEvent;
use crate::history::HistoryManager;
use crate::naming::{self, parse_branch_table_name, sequence_name, BranchTableName, BRANCH_SEQUENCE, VERSION_SEQUENCE};
use crate::refs::Ref;
use crate::types::{
    BranchOperationResult, CommitResult, MergeOperationResult, Modification, NodeId,
    OnMergeConflict, OnVersionConflict, MAIN_NODE_ID,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of pruning unreferenced branch tables.
#[derive(Clone, Debug, Default)]
pub struct PruneResult {
    /// Tables that were dropped.
    pub deleted: Vec<String>,
    /// Branch nodes that are still referenced, directly or as a base.
    pub kept: Vec<NodeId>,
    /// Errors encountered while dropping, by table.
    pub errors: Vec<(String, String)>,
}

/// Branch topology, lifecycle, rebase and merge of one space.
pub struct BranchManager {
    context: Arc<EngineContext>,
    commits: CommitManager,
    history: HistoryManager,
}

impl BranchManager {
    /// Manager over an existing context.
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            commits: CommitManager::new(context.clone()),
            history: HistoryManager::new(context.clone()),
            context,
        }
    }

    /// Build the context for `config` and a manager on top of it.
    pub fn open(backend: Arc<dyn Backend>, config: EngineConfig) -> Result<Self> {
        let context = EngineContext::new(backend, config)?;
        Ok(Self::new(Arc::new(context)))
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn commits(&self) -> &CommitManager {
        &self.commits
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    // --- Branch Lifecycle ---

    /// Create a branch on `base_ref`.
    ///
    /// A HEAD ref is resolved first; a concrete version must not be ahead of
    /// the base branch's HEAD. Returns the new branch's ref, whose version is
    /// the base version (the branch starts out without versions of its own).
    pub fn create_branch(&self, base_ref: &Ref) -> Result<Ref> {
        let _guard = self.context.lock_structure();

        let base_ref = if base_ref.is_head() {
            self.resolve_head(base_ref)?
        } else {
            let version = base_ref.require_version()?;
            let current_head = self.resolve_head(&Self::head_ref(base_ref.node_id()?))?;
            let head_version = current_head.require_version()?;
            if version > head_version {
                return Err(EngineError::InvalidArgument(format!(
                    "Branch could not be created: The provided base ref points to a version that is \
                     larger than the current HEAD of the base branch: HEAD={}",
                    head_version
                )));
            }
            base_ref.clone()
        };

        let base_node_id = base_ref.node_id()?;
        let base_version = base_ref.require_version()?;
        let node_id = self.new_node_id()?;

        let entry = BranchTableName {
            base_node_id,
            base_version,
            node_id,
        };
        let table = self.context.lineage().table_name(&entry);
        let spec = TableSpec {
            space_id: self.context.config().space_id.clone(),
            partitions: self.context.config().partitions,
        };
        self.context
            .backend()
            .create_table(self.context.schema(), &table, &spec)?;
        self.context.lineage().insert(entry);

        info!(
            stream_id = %self.context.config().stream_id,
            node_id,
            base_ref = %base_ref,
            table = %table,
            "Created branch"
        );
        self.context.events().publish(BranchEvent::BranchCreated {
            node_id,
            base_ref: base_ref.clone(),
        });

        Ok(Ref::node(node_id, base_version))
    }

    /// Write a commit into a branch.
    ///
    /// A HEAD `base_ref` leaves the conflict baseline to the feature writer;
    /// a concrete one makes the writer detect changes made after it.
    pub fn write_commit(
        &self,
        node_id: NodeId,
        modifications: Vec<Modification>,
        author: &str,
        base_ref: &Ref,
        version: Option<u64>,
    ) -> Result<CommitResult> {
        let base_version = if base_ref.is_head() {
            None
        } else {
            Some(base_ref.require_version()?)
        };
        self.commits
            .write_commit(node_id, modifications, author, base_version, version)
    }

    /// Drop a branch table unless other branches are based on it.
    ///
    /// Returns false (and drops nothing) for main and for branches with
    /// dependants.
    pub fn delete_branch(&self, node_id: NodeId) -> Result<bool> {
        if node_id == MAIN_NODE_ID {
            warn!("Refusing to delete the main branch");
            return Ok(false);
        }

        let _guard = self.context.lock_structure();

        if self.has_branches(node_id)? {
            info!(node_id, "Branch has dependants, not deleting");
            return Ok(false);
        }

        let table = self.context.table_name(node_id)?;
        self.context
            .backend()
            .drop_table(self.context.schema(), &table)?;
        self.context.lineage().remove(node_id);

        info!(node_id, table = %table, "Deleted branch");
        self.context
            .events()
            .publish(BranchEvent::BranchDeleted { node_id });
        Ok(true)
    }

    /// Drop every branch table of the root table. Main stays.
    ///
    /// Returns the number of dropped tables.
    pub fn delete_all_branch_tables(&self) -> Result<usize> {
        let _guard = self.context.lock_structure();

        let root = self.context.root_table();
        let branches: Vec<(String, NodeId)> = self
            .context
            .backend()
            .list_tables(self.context.schema())?
            .into_iter()
            .filter_map(|name| parse_branch_table_name(root, &name).map(|d| (name, d.node_id)))
            .collect();

        for (table, _) in &branches {
            self.context
                .backend()
                .drop_table(self.context.schema(), table)?;
        }
        self.context.refresh_lineage()?;

        info!(count = branches.len(), "Deleted all branch tables");
        for (_, node_id) in &branches {
            self.context
                .events()
                .publish(BranchEvent::BranchDeleted { node_id: *node_id });
        }
        Ok(branches.len())
    }

    /// Drop all branch tables no longer reachable from `existing`.
    ///
    /// Every node that is a key of `existing`, or is pointed to by one of its
    /// refs, is kept together with all of its bases. All other branch tables
    /// are dropped, deepest first. Versions inside kept tables are not pruned.
    pub fn prune(&self, existing: &HashMap<NodeId, Ref>) -> Result<PruneResult> {
        let _guard = self.context.lock_structure();
        self.context.refresh_lineage()?;
        let lineage = self.context.lineage();

        let mut safe: HashSet<NodeId> = existing.keys().copied().collect();
        safe.extend(existing.values().filter_map(|r| r.node_id().ok()));

        let mut frontier: Vec<NodeId> = safe.iter().copied().collect();
        while let Some(node_id) = frontier.pop() {
            if let Some(entry) = lineage.get(node_id) {
                if entry.base_node_id != MAIN_NODE_ID && safe.insert(entry.base_node_id) {
                    frontier.push(entry.base_node_id);
                }
            }
        }

        let mut doomed: Vec<(usize, BranchTableName)> = lineage
            .nodes()
            .into_iter()
            .filter(|n| !safe.contains(n))
            .filter_map(|n| lineage.get(n))
            .map(|entry| (self.depth(entry.node_id), entry))
            .collect();
        doomed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.node_id.cmp(&b.1.node_id)));

        let mut result = PruneResult::default();
        for (_, entry) in doomed {
            let table = lineage.table_name(&entry);
            match self
                .context
                .backend()
                .drop_table(self.context.schema(), &table)
            {
                Ok(()) => {
                    lineage.remove(entry.node_id);
                    self.context.events().publish(BranchEvent::BranchDeleted {
                        node_id: entry.node_id,
                    });
                    result.deleted.push(table);
                }
                Err(e) => {
                    warn!(table = %table, error = %e, "Failed to drop branch table");
                    result.errors.push((table, e.to_string()));
                }
            }
        }

        result.kept = lineage
            .nodes()
            .into_iter()
            .filter(|n| safe.contains(n))
            .collect();

        info!(
            deleted = result.deleted.len(),
            kept = result.kept.len(),
            errors = result.errors.len(),
            "Pruned branch tables"
        );
        Ok(result)
    }

    // --- Rebase & Merge ---

    /// Replay a branch onto a new base.
    ///
    /// Creates a branch on `new_base_ref` and replays every changeset between
    /// the common ancestor of `base_ref` and the new base and the HEAD of
    /// `node_id` into it. Conflicts are written and counted, never fatal. The
    /// original branch is left alone.
    pub fn rebase(&self, node_id: NodeId, base_ref: &Ref, new_base_ref: &Ref) -> Result<BranchOperationResult> {
        let _guard = self.context.lock_structure();
        base_ref.require_version()?;

        let new_branch = self.create_branch(new_base_ref)?;
        let new_node_id = new_branch.node_id()?;
        let new_base_version = new_branch.require_version()?;
        let new_base_ref = new_base_ref.at_version(new_base_version);

        let ancestor = self.find_base_ref_in_common_ancestor(base_ref, &new_base_ref)?;
        let ancestor_version = ancestor.require_version()?;

        let mut changesets = self
            .history
            .iterate_changesets(&ancestor, &Self::head_ref(node_id))?;

        let mut total = CommitResult::default();
        let mut last_version = None;
        while let Some(changeset) = changesets.next_changeset()? {
            let version = changeset.version - ancestor_version + new_base_version;
            let modifications =
                changeset.to_modifications(OnVersionConflict::Merge, OnMergeConflict::Continue);
            total += self.commits.replay_commit(
                new_node_id,
                modifications,
                &changeset.author,
                ancestor_version,
                version,
                new_base_version + 1,
            )?;
            last_version = Some(version);
        }

        if let Some(version) = last_version {
            self.set_next_version(new_node_id, &new_base_ref, version - new_base_version)?;
        }

        let result = BranchOperationResult {
            node_id: new_node_id,
            base_ref: new_base_ref,
            conflicting: total.has_conflicts(),
        };

        info!(
            node_id,
            new_node_id,
            ancestor = %ancestor,
            base_ref = %result.base_ref,
            ?last_version,
            conflicting = total.conflicting,
            "Rebased branch"
        );
        self.context.events().publish(BranchEvent::Rebased {
            node_id,
            new_node_id,
            base_ref: result.base_ref.clone(),
            conflicting: result.conflicting,
        });

        Ok(result)
    }

    /// Merge a branch into a target branch as one squashed commit.
    ///
    /// The source's changes since the common ancestor are replayed into a
    /// temporary branch on the target's HEAD, all at `HEAD + 1`. If that
    /// produced conflicts the merge pauses and the result points at the
    /// temporary branch. Otherwise the squashed changeset is copied into the
    /// target and the temporary branch is deleted.
    pub fn merge(
        &self,
        node_id: NodeId,
        base_ref: &Ref,
        target_node_id: NodeId,
        fast_forward: bool,
    ) -> Result<MergeOperationResult> {
        if fast_forward {
            return Err(EngineError::Unsupported(
                "fast-forward merge is not implemented yet".into(),
            ));
        }

        let _guard = self.context.lock_structure();
        base_ref.require_version()?;

        let source_head = self.resolve_head(&Self::head_ref(node_id))?;
        let merged_source_version = source_head.require_version()?;

        let target_ref = self.resolve_head(&Self::head_ref(target_node_id))?;
        let target_version = target_ref.require_version()?;
        let tmp_node_id = self.create_branch(&target_ref)?.node_id()?;

        let merge_version = target_version + 1;
        let merge_ref = target_ref.at_version(merge_version);
        let ancestor = self.find_base_ref_in_common_ancestor(base_ref, &target_ref)?;
        let ancestor_version = ancestor.require_version()?;

        let mut changesets = self.history.iterate_changesets(&ancestor, &source_head)?;
        let mut total = CommitResult::default();
        let mut replayed = 0usize;
        while let Some(changeset) = changesets.next_changeset()? {
            let modifications =
                changeset.to_modifications(OnVersionConflict::Merge, OnMergeConflict::Continue);
            total += self.commits.replay_commit(
                tmp_node_id,
                modifications,
                &changeset.author,
                ancestor_version,
                merge_version,
                merge_version,
            )?;
            replayed += 1;
        }

        let result = MergeOperationResult {
            node_id,
            base_ref: base_ref.clone(),
            conflicting: false,
            merged_source_version,
            resolved_merge_target_ref: merge_ref.clone(),
        };

        // Replayed changes may cancel out, leaving the temporary branch empty.
        if replayed == 0 || self.load_head_version(tmp_node_id)? == target_version {
            debug!(node_id, target_node_id, replayed, "Nothing to merge");
            self.delete_branch(tmp_node_id)?;
            return Ok(result);
        }
        self.next_version(tmp_node_id)?;

        if total.has_conflicts() {
            info!(
                node_id,
                target_node_id,
                tmp_node_id,
                conflicting = total.conflicting,
                merge_ref = %merge_ref,
                "Merge paused on conflicts"
            );
            self.context.events().publish(BranchEvent::MergePaused {
                source_node_id: node_id,
                tmp_node_id,
                merge_ref: merge_ref.clone(),
            });
            return Ok(MergeOperationResult {
                node_id: tmp_node_id,
                base_ref: target_ref,
                conflicting: true,
                ..result
            });
        }

        self.next_version(target_node_id)?;
        let mut squashed = self
            .history
            .iterate_changesets(&target_ref, &Self::head_ref(tmp_node_id))?;
        while let Some(changeset) = squashed.next_changeset()? {
            let modifications =
                changeset.to_modifications(OnVersionConflict::Merge, OnMergeConflict::Error);
            self.commits.write_commit(
                target_node_id,
                modifications,
                &changeset.author,
                Some(target_version),
                Some(merge_version),
            )?;
        }

        self.delete_branch(tmp_node_id)?;

        info!(
            node_id,
            target_node_id,
            ancestor = %ancestor,
            replayed,
            merge_ref = %merge_ref,
            "Merged branch"
        );
        self.context.events().publish(BranchEvent::Merged {
            source_node_id: node_id,
            target_node_id,
            merge_ref,
        });

        Ok(result)
    }

    /// Nearest base ref shared by the lineages of two refs.
    pub fn find_base_ref_in_common_ancestor(&self, source: &Ref, target: &Ref) -> Result<Ref> {
        let source_path = self.branch_path(source.node_id()?)?;
        let target_path = self.branch_path(target.node_id()?)?;
        common_ancestor(source, &source_path, target, &target_path)
    }

    // --- Naming & Lineage ---

    /// Physical table of a node.
    pub fn branch_table_name(&self, node_id: NodeId) -> Result<String> {
        self.context.table_name(node_id)
    }

    /// Table name a branch of `base_ref` with id `node_id` has.
    pub fn branch_table_name_for(&self, base_ref: &Ref, node_id: NodeId) -> Result<String> {
        Ok(naming::branch_table_name(
            self.context.root_table(),
            base_ref.node_id()?,
            base_ref.require_version()?,
            node_id,
        ))
    }

    /// Ref a branch was forked from.
    pub fn base_ref(&self, node_id: NodeId) -> Result<Ref> {
        if node_id == MAIN_NODE_ID {
            return Err(EngineError::InvalidArgument(
                "The main branch has no base ref".into(),
            ));
        }
        self.context.base_ref(node_id)
    }

    /// Base refs connecting main to `node_id`, earliest first.
    pub fn branch_path(&self, node_id: NodeId) -> Result<Vec<Ref>> {
        self.context.branch_path(MAIN_NODE_ID, node_id)
    }

    /// Base refs connecting `start` to `node_id`, earliest first.
    pub fn branch_path_from(&self, start: NodeId, node_id: NodeId) -> Result<Vec<Ref>> {
        self.context.branch_path(start, node_id)
    }

    /// HEAD ref of a node.
    pub fn head_ref(node_id: NodeId) -> Ref {
        Ref::node_head(node_id)
    }

    /// Replace HEAD by the branch's current version. Other refs pass through.
    pub fn resolve_head(&self, r: &Ref) -> Result<Ref> {
        if !r.is_head() {
            return Ok(r.clone());
        }
        let version = self.load_head_version(r.node_id()?)?;
        Ok(r.at_version(version))
    }

    /// True if any branch table is based on `node_id`. Reads the catalog.
    pub fn has_branches(&self, node_id: NodeId) -> Result<bool> {
        self.context.refresh_lineage()?;
        Ok(!self.context.lineage().children(node_id).is_empty())
    }

    // --- Private Helpers ---

    fn load_head_version(&self, node_id: NodeId) -> Result<u64> {
        let table = self.context.table_name(node_id)?;
        let max_version = self
            .context
            .backend()
            .max_version(self.context.schema(), &table)?;
        Ok(max_version + self.context.base_version(node_id)?)
    }

    fn new_node_id(&self) -> Result<NodeId> {
        let sequence = sequence_name(self.context.root_table(), BRANCH_SEQUENCE);
        loop {
            let value = self
                .context
                .backend()
                .next_value(self.context.schema(), &sequence)?;
            let node_id = NodeId::try_from(value).map_err(|_| {
                BackendError::Sequence(format!("{} exhausted at {}", sequence, value))
            })?;
            // Ids taken by tables the sequence does not know about are skipped.
            if node_id != MAIN_NODE_ID && self.context.lineage().get(node_id).is_none() {
                return Ok(node_id);
            }
            debug!(node_id, "Skipping node id already in use");
        }
    }

    fn next_version(&self, node_id: NodeId) -> Result<u64> {
        let table = self.context.table_name(node_id)?;
        let sequence = sequence_name(&table, VERSION_SEQUENCE);
        Ok(self
            .context
            .backend()
            .next_value(self.context.schema(), &sequence)?)
    }

    fn set_next_version(&self, node_id: NodeId, base_ref: &Ref, value: u64) -> Result<()> {
        let table = self.branch_table_name_for(base_ref, node_id)?;
        let sequence = sequence_name(&table, VERSION_SEQUENCE);
        self.context
            .backend()
            .set_value(self.context.schema(), &sequence, value)?;
        Ok(())
    }

    /// Number of bases between a node and main, as far as the lineage knows.
    fn depth(&self, node_id: NodeId) -> usize {
        let lineage = self.context.lineage();
        let mut depth = 0;
        let mut current = node_id;
        let mut visited = HashSet::new();
        while let Some(entry) = lineage.get(current) {
            if !visited.insert(current) {
                break;
            }
            depth += 1;
            current = entry.base_node_id;
        }
        depth
    }
}

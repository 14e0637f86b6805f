//! In-process backing store.
//!
//! Models the relational store the engine normally runs against: tables hold
//! feature rows with versions relative to the table's base version, sequences
//! are plain counters, and the feature-writer and changeset-query contracts
//! are implemented on top of those rows.

use super::{
    ChangesetPage, ChangesetQuery, ChangesetSource, FeatureWriter, SequenceStore, TableCatalog,
    TableSpec, WriteRequest,
};
use crate::error::{BackendError, BackendResult};
use crate::naming::{parse_branch_table_name, partition_name, sequence_name, BRANCH_SEQUENCE, VERSION_SEQUENCE};
use crate::refs::RefVersion;
use crate::types::{
    Changeset, Feature, NodeId, OnMergeConflict, OnVersionConflict, Timestamp, UpdateStrategy,
    MAIN_NODE_ID,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// How a row changed its feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(super) enum RowOperation {
    Insert,
    Update,
    Delete,
}

/// One version of one feature in one table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(super) struct FeatureRow {
    pub id: String,
    /// Version relative to the table's base version.
    pub version: u64,
    pub operation: RowOperation,
    pub feature: Feature,
    pub author: String,
    pub created_at: Timestamp,
    pub conflicting: bool,
}

impl FeatureRow {
    fn state(&self) -> Option<&Feature> {
        match self.operation {
            RowOperation::Delete => None,
            _ => Some(&self.feature),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(super) struct MemoryTable {
    /// Set for partition tables.
    pub partition_of: Option<String>,
    pub rows: Vec<FeatureRow>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(super) struct SchemaState {
    pub tables: BTreeMap<String, MemoryTable>,
    pub sequences: HashMap<String, u64>,
}

/// Everything the backend holds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(super) struct MemoryState {
    pub schemas: BTreeMap<String, SchemaState>,
}

/// In-process implementation of every backend collaborator.
#[derive(Default)]
pub struct MemoryBackend {
    pub(super) state: RwLock<MemoryState>,
}

/// Newest row of a feature visible through a table chain.
struct Visible<'a> {
    table_index: usize,
    /// Absolute version.
    version: u64,
    row: &'a FeatureRow,
}

/// What the writer decided for one feature.
enum Decision {
    /// Write this state (None = delete); the flag marks a conflicting write.
    Write(Option<Feature>, bool),
    Skip,
}

enum MergeOutcome {
    Merged(Option<Feature>),
    Conflict,
}

/// Row staged by the current write batch.
struct Staged {
    row: FeatureRow,
    existed_before: bool,
    /// Remove the table's row at this (id, version) instead of writing one.
    discard: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the main table of a space.
    pub fn create_space(&self, schema: &str, root_table: &str) -> BackendResult<()> {
        self.create_table(schema, root_table, &TableSpec::default())
    }

    /// Number of rows stored in a table.
    pub fn row_count(&self, schema: &str, table: &str) -> BackendResult<usize> {
        let state = self.state.read();
        Ok(table_ref(&state, schema, table)?.rows.len())
    }

    /// Distinct stored (relative) versions of a table, ascending.
    pub fn versions(&self, schema: &str, table: &str) -> BackendResult<Vec<u64>> {
        let state = self.state.read();
        let versions: BTreeSet<u64> = table_ref(&state, schema, table)?
            .rows
            .iter()
            .map(|r| r.version)
            .collect();
        Ok(versions.into_iter().collect())
    }

    /// Ids of features written as conflicting into a table.
    pub fn conflicting_features(&self, schema: &str, table: &str) -> BackendResult<Vec<String>> {
        let state = self.state.read();
        let ids: BTreeSet<String> = table_ref(&state, schema, table)?
            .rows
            .iter()
            .filter(|r| r.conflicting)
            .map(|r| r.id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// Current state of a feature as seen through a table chain.
    pub fn read_feature(
        &self,
        schema: &str,
        tables: &[String],
        table_base_versions: &[u64],
        id: &str,
    ) -> BackendResult<Option<Feature>> {
        if tables.len() != table_base_versions.len() {
            return Err(BackendError::Protocol("table chain and base versions differ in length".into()));
        }
        let state = self.state.read();
        let schema_state = schema_ref(&state, schema)?;
        let head = visible_row(schema_state, tables, table_base_versions, id, None)?;
        Ok(head.and_then(|h| h.row.state().cloned()))
    }
}

impl TableCatalog for MemoryBackend {
    fn list_tables(&self, schema: &str) -> BackendResult<Vec<String>> {
        let state = self.state.read();
        Ok(state
            .schemas
            .get(schema)
            .map(|s| s.tables.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn create_table(&self, schema: &str, table: &str, spec: &TableSpec) -> BackendResult<()> {
        let mut state = self.state.write();
        let schema_state = state.schemas.entry(schema.to_string()).or_default();

        if schema_state.tables.contains_key(table) {
            return Err(BackendError::TableExists(format!("{}.{}", schema, table)));
        }

        schema_state.tables.insert(table.to_string(), MemoryTable::default());
        schema_state
            .sequences
            .insert(sequence_name(table, VERSION_SEQUENCE), 0);

        for i in 0..spec.partitions.unwrap_or(0) {
            schema_state.tables.insert(
                partition_name(table, i),
                MemoryTable {
                    partition_of: Some(table.to_string()),
                    rows: Vec::new(),
                },
            );
        }

        debug!(schema, table, partitions = ?spec.partitions, "Created table");
        Ok(())
    }

    fn drop_table(&self, schema: &str, table: &str) -> BackendResult<()> {
        let mut state = self.state.write();
        let Some(schema_state) = state.schemas.get_mut(schema) else {
            return Ok(());
        };

        if schema_state.tables.remove(table).is_none() {
            return Ok(());
        }
        schema_state
            .tables
            .retain(|_, t| t.partition_of.as_deref() != Some(table));
        schema_state
            .sequences
            .remove(&sequence_name(table, VERSION_SEQUENCE));
        schema_state
            .sequences
            .remove(&sequence_name(table, BRANCH_SEQUENCE));

        debug!(schema, table, "Dropped table");
        Ok(())
    }

    fn max_version(&self, schema: &str, table: &str) -> BackendResult<u64> {
        let state = self.state.read();
        Ok(table_ref(&state, schema, table)?
            .rows
            .iter()
            .map(|r| r.version)
            .max()
            .unwrap_or(0))
    }
}

impl SequenceStore for MemoryBackend {
    fn next_value(&self, schema: &str, sequence: &str) -> BackendResult<u64> {
        let mut state = self.state.write();
        let schema_state = state.schemas.entry(schema.to_string()).or_default();
        Ok(next_sequence_value(schema_state, sequence))
    }

    fn set_value(&self, schema: &str, sequence: &str, value: u64) -> BackendResult<()> {
        let mut state = self.state.write();
        let schema_state = state.schemas.entry(schema.to_string()).or_default();
        schema_state.sequences.insert(sequence.to_string(), value);
        Ok(())
    }
}

impl FeatureWriter for MemoryBackend {
    fn write_features(&self, request: &WriteRequest) -> BackendResult<Vec<Value>> {
        let tables = &request.tables;
        let bases = &request.table_base_versions;
        if tables.is_empty() || tables.len() != bases.len() {
            return Err(BackendError::Protocol(
                "write request needs a non-empty table chain with one base version per table".into(),
            ));
        }

        let target_index = tables.len() - 1;
        let target = &tables[target_index];
        let offset = bases[target_index];

        let mut state = self.state.write();
        let schema = state
            .schemas
            .get_mut(&request.schema)
            .ok_or_else(|| BackendError::MissingTable(format!("{}.{}", request.schema, target)))?;
        if !schema.tables.contains_key(target) {
            return Err(BackendError::MissingTable(format!("{}.{}", request.schema, target)));
        }

        let version = match request.version {
            Some(v) if v <= offset => {
                return Err(BackendError::Protocol(format!(
                    "version {} is not above the base version {} of {}",
                    v, offset, target
                )))
            }
            Some(v) => v,
            None => next_sequence_value(schema, &sequence_name(target, VERSION_SEQUENCE)) + offset,
        };

        let created_at = Timestamp::now();
        let mut staged: Vec<Staged> = Vec::new();
        let mut count = 0u64;
        let mut conflicting = 0u64;

        for modification in &request.modifications {
            let strategy = modification.update_strategy;
            let writes = modification.features.iter().map(|f| (f.id.as_str(), Some(f)));
            let deletes = modification.deleted_ids.iter().map(|id| (id.as_str(), None));

            for (id, incoming) in writes.chain(deletes) {
                let staged_pos = staged.iter().position(|s| s.row.id == id);

                let (decision, existed_before, rewrites_row) = match staged_pos {
                    // Already written by this batch: own output, never a conflict.
                    Some(pos) => (
                        Decision::Write(incoming.cloned(), false),
                        staged[pos].existed_before,
                        true,
                    ),
                    None => {
                        let head = visible_row(schema, tables, bases, id, None)?;
                        let before = match &head {
                            Some(h) if h.version >= version => {
                                visible_row(schema, tables, bases, id, Some(version - 1))?
                            }
                            _ => None,
                        };
                        let existed_before = match (&head, &before) {
                            (Some(h), _) if h.version < version => h.row.state().is_some(),
                            (_, Some(b)) => b.row.state().is_some(),
                            _ => false,
                        };

                        // Output of earlier steps of the same replay is not a conflict.
                        let own_output = |h: &Visible<'_>| {
                            h.table_index == target_index
                                && request
                                    .replay_floor
                                    .map_or(false, |floor| h.version >= floor && h.version <= version)
                        };
                        let in_conflict = match (request.base_version, &head) {
                            (Some(base), Some(h)) => h.version > base && !own_output(h),
                            _ => false,
                        };
                        let rewrites_row = head
                            .as_ref()
                            .map_or(false, |h| h.table_index == target_index && h.version == version);

                        let decision = if in_conflict {
                            let head_state = head.as_ref().and_then(|h| h.row.state());
                            resolve_version_conflict(
                                schema,
                                request,
                                strategy,
                                id,
                                version,
                                head_state,
                                incoming,
                            )?
                        } else {
                            Decision::Write(incoming.cloned(), false)
                        };
                        (decision, existed_before, rewrites_row)
                    }
                };

                let Decision::Write(new_state, is_conflict) = decision else {
                    continue;
                };

                let operation = match (&new_state, existed_before) {
                    (None, false) => {
                        // Deleting something that did not exist before this
                        // version: drop what this version holds for it.
                        match staged_pos {
                            Some(pos) => staged[pos].discard = true,
                            None if rewrites_row => {
                                staged.push(Staged {
                                    row: FeatureRow {
                                        id: id.to_string(),
                                        version: version - offset,
                                        operation: RowOperation::Delete,
                                        feature: Feature::new(id),
                                        author: request.author.clone(),
                                        created_at,
                                        conflicting: false,
                                    },
                                    existed_before,
                                    discard: true,
                                });
                                count += 1;
                            }
                            None => {}
                        }
                        continue;
                    }
                    (None, true) => RowOperation::Delete,
                    (Some(_), true) => RowOperation::Update,
                    (Some(_), false) => RowOperation::Insert,
                };

                let row = FeatureRow {
                    id: id.to_string(),
                    version: version - offset,
                    operation,
                    feature: new_state.unwrap_or_else(|| Feature::new(id)),
                    author: request.author.clone(),
                    created_at,
                    conflicting: is_conflict,
                };

                match staged_pos {
                    Some(pos) => {
                        let was_conflicting = staged[pos].row.conflicting;
                        staged[pos].row = row;
                        staged[pos].row.conflicting |= was_conflicting;
                        staged[pos].discard = false;
                    }
                    None => staged.push(Staged {
                        row,
                        existed_before,
                        discard: false,
                    }),
                }

                count += 1;
                if is_conflict {
                    conflicting += 1;
                }
            }
        }

        let table = schema
            .tables
            .get_mut(target)
            .ok_or_else(|| BackendError::MissingTable(format!("{}.{}", request.schema, target)))?;
        for Staged { row, discard, .. } in staged {
            let existing = table
                .rows
                .iter()
                .position(|r| r.id == row.id && r.version == row.version);
            match (existing, discard) {
                (Some(pos), true) => {
                    table.rows.remove(pos);
                }
                (None, true) => {}
                (Some(pos), false) => table.rows[pos] = row,
                (None, false) => table.rows.push(row),
            }
        }

        debug!(table = %target, version, count, conflicting, "Wrote features");
        Ok(vec![json!({ "count": count, "conflicting": conflicting })])
    }
}

impl ChangesetSource for MemoryBackend {
    fn query_changesets(&self, query: &ChangesetQuery) -> BackendResult<ChangesetPage> {
        let (start, end) = match query.range.ref_version() {
            RefVersion::Range { start, end } => (start, end),
            _ => {
                return Err(BackendError::Protocol(format!(
                    "changeset query needs a range ref, got {}",
                    query.range
                )))
            }
        };
        let end_node = query
            .range
            .node_id()
            .map_err(|e| BackendError::Protocol(e.to_string()))?;

        // One segment per node on the path, bounded by the version the next
        // node was forked at; the end node is bounded by the range end.
        let mut segments: Vec<(NodeId, Option<u64>)> = Vec::with_capacity(query.branch_path.len() + 1);
        for base_ref in &query.branch_path {
            let node = base_ref
                .node_id()
                .map_err(|e| BackendError::Protocol(e.to_string()))?;
            let version = base_ref.version().ok_or_else(|| {
                BackendError::Protocol(format!("branch path entry {} is not resolved", base_ref))
            })?;
            segments.push((node, Some(version)));
        }
        segments.push((end_node, end));

        let state = self.state.read();
        let schema = schema_ref(&state, &query.schema)?;

        let mut entries: Vec<(u64, &FeatureRow)> = Vec::new();
        for (node, upper) in segments {
            let (table, offset) = locate_node_table(schema, &query.root_table, node)?;
            for row in &table.rows {
                let v = row.version + offset;
                let in_range = v > start
                    && upper.map_or(true, |u| v <= u)
                    && end.map_or(true, |e| v <= e)
                    && query.min_version.map_or(true, |m| v >= m);
                if in_range {
                    entries.push((v, row));
                }
            }
        }
        entries.sort_by_key(|(v, _)| *v);

        let first = match &query.page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| BackendError::Protocol(format!("invalid page token: {}", token)))?,
        };
        let first = first.min(entries.len());
        let last = (first + query.page_size.max(1)).min(entries.len());

        let mut changesets: Vec<Changeset> = Vec::new();
        for (version, row) in &entries[first..last] {
            if changesets.last().map_or(true, |c| c.version != *version) {
                changesets.push(Changeset::new(*version, row.author.clone(), row.created_at));
            }
            if let Some(changeset) = changesets.last_mut() {
                let feature = row.feature.clone();
                match row.operation {
                    RowOperation::Insert => changeset.inserted.push(feature),
                    RowOperation::Update => changeset.updated.push(feature),
                    RowOperation::Delete => changeset.deleted.push(feature),
                }
            }
        }

        Ok(ChangesetPage {
            changesets,
            next_page_token: (last < entries.len()).then(|| last.to_string()),
        })
    }
}

fn schema_ref<'a>(state: &'a MemoryState, schema: &str) -> BackendResult<&'a SchemaState> {
    state
        .schemas
        .get(schema)
        .ok_or_else(|| BackendError::MissingTable(format!("schema {}", schema)))
}

fn table_ref<'a>(state: &'a MemoryState, schema: &str, table: &str) -> BackendResult<&'a MemoryTable> {
    schema_ref(state, schema)?
        .tables
        .get(table)
        .ok_or_else(|| BackendError::MissingTable(format!("{}.{}", schema, table)))
}

fn next_sequence_value(schema: &mut SchemaState, sequence: &str) -> u64 {
    let value = schema.sequences.entry(sequence.to_string()).or_insert(0);
    *value += 1;
    *value
}

/// Table of a node and the node's base version.
fn locate_node_table<'a>(
    schema: &'a SchemaState,
    root_table: &str,
    node: NodeId,
) -> BackendResult<(&'a MemoryTable, u64)> {
    if node == MAIN_NODE_ID {
        let table = schema
            .tables
            .get(root_table)
            .ok_or_else(|| BackendError::MissingTable(root_table.to_string()))?;
        return Ok((table, 0));
    }
    schema
        .tables
        .iter()
        .find_map(|(name, table)| {
            parse_branch_table_name(root_table, name)
                .filter(|decoded| decoded.node_id == node)
                .map(|decoded| (table, decoded.base_version))
        })
        .ok_or(BackendError::TableNotFound(node))
}

/// Newest row of `id` visible through the chain, optionally capped at `at`.
///
/// Rows of table `i` are visible up to the base version of table `i + 1`.
fn visible_row<'a>(
    schema: &'a SchemaState,
    tables: &[String],
    bases: &[u64],
    id: &str,
    at: Option<u64>,
) -> BackendResult<Option<Visible<'a>>> {
    let mut best: Option<Visible<'a>> = None;
    for (i, name) in tables.iter().enumerate() {
        let table = schema
            .tables
            .get(name)
            .ok_or_else(|| BackendError::MissingTable(name.clone()))?;
        let offset = bases[i];
        let limit = bases.get(i + 1).copied();

        for row in table.rows.iter().filter(|r| r.id == id) {
            let version = row.version + offset;
            if limit.map_or(false, |l| version > l) || at.map_or(false, |a| version > a) {
                continue;
            }
            if best.as_ref().map_or(true, |b| version >= b.version) {
                best = Some(Visible {
                    table_index: i,
                    version,
                    row,
                });
            }
        }
    }
    Ok(best)
}

fn resolve_version_conflict(
    schema: &SchemaState,
    request: &WriteRequest,
    strategy: UpdateStrategy,
    id: &str,
    version: u64,
    head: Option<&Feature>,
    incoming: Option<&Feature>,
) -> BackendResult<Decision> {
    let conflict = || BackendError::Conflict {
        feature_id: id.to_string(),
        version,
    };

    match strategy.on_version_conflict {
        OnVersionConflict::Error => Err(conflict()),
        OnVersionConflict::Replace => Ok(Decision::Write(incoming.cloned(), false)),
        OnVersionConflict::Retain => Ok(Decision::Skip),
        OnVersionConflict::Merge => {
            let base = match request.base_version {
                Some(base) => visible_row(schema, &request.tables, &request.table_base_versions, id, Some(base))?
                    .and_then(|v| v.row.state().cloned()),
                None => None,
            };
            match merge_three_way(base.as_ref(), head, incoming) {
                MergeOutcome::Merged(state) => Ok(Decision::Write(state, false)),
                MergeOutcome::Conflict => match strategy.on_merge_conflict {
                    OnMergeConflict::Continue => Ok(Decision::Write(incoming.cloned(), true)),
                    OnMergeConflict::Replace => Ok(Decision::Write(incoming.cloned(), false)),
                    OnMergeConflict::Retain => Ok(Decision::Skip),
                    OnMergeConflict::Error => Err(conflict()),
                },
            }
        }
    }
}

/// Property-level three-way merge. `None` stands for a deleted feature.
fn merge_three_way(base: Option<&Feature>, head: Option<&Feature>, incoming: Option<&Feature>) -> MergeOutcome {
    if head == incoming || base == head {
        return MergeOutcome::Merged(incoming.cloned());
    }
    if base == incoming {
        return MergeOutcome::Merged(head.cloned());
    }

    let (Some(head), Some(incoming)) = (head, incoming) else {
        // Delete on one side, change on the other.
        return MergeOutcome::Conflict;
    };

    let empty = Map::new();
    let base_props = base.map_or(&empty, |b| &b.properties);
    let keys: BTreeSet<&String> = base_props.keys().chain(incoming.properties.keys()).collect();

    let mut merged = head.clone();
    for key in keys {
        let original = base_props.get(key);
        let theirs = incoming.properties.get(key);
        if theirs == original {
            continue;
        }
        let ours = head.properties.get(key);
        if ours != original && ours != theirs {
            return MergeOutcome::Conflict;
        }
        match theirs {
            Some(value) => merged.properties.insert(key.clone(), value.clone()),
            None => merged.properties.remove(key),
        };
    }

    let original_geometry = base.and_then(|b| b.geometry.as_ref());
    if incoming.geometry.as_ref() != original_geometry {
        if head.geometry.as_ref() != original_geometry && head.geometry != incoming.geometry {
            return MergeOutcome::Conflict;
        }
        merged.geometry = incoming.geometry.clone();
    }

    MergeOutcome::Merged(Some(merged))
}

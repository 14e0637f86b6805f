//! Core value types shared by the managers and the backend collaborators.

use crate::refs::Ref;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::ops::AddAssign;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a branch node. Node `0` is the main branch.
pub type NodeId = u32;

/// Node id of the permanent main branch.
pub const MAIN_NODE_ID: NodeId = 0;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single feature of a space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Value>,

    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Feature {
    /// Create a feature without geometry or properties.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            geometry: None,
            properties: Map::new(),
        }
    }

    /// Set a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the geometry.
    pub fn with_geometry(mut self, geometry: Value) -> Self {
        self.geometry = Some(geometry);
        self
    }
}

/// What to do when the feature was changed after the writer's base version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnVersionConflict {
    /// Try a three-way merge against the state at the base version.
    Merge,
    /// Overwrite the newer version.
    Replace,
    /// Keep the newer version, skip the write.
    Retain,
    /// Abort the whole batch.
    Error,
}

/// What to do when a three-way merge could not combine both sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnMergeConflict {
    /// Write the incoming feature, mark it conflicting and keep going.
    Continue,
    /// Write the incoming feature as if there was no conflict.
    Replace,
    /// Keep the existing feature.
    Retain,
    /// Abort the whole batch.
    Error,
}

/// Conflict handling for one modification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateStrategy {
    pub on_version_conflict: OnVersionConflict,
    pub on_merge_conflict: OnMergeConflict,
}

impl UpdateStrategy {
    pub fn new(on_version_conflict: OnVersionConflict, on_merge_conflict: OnMergeConflict) -> Self {
        Self {
            on_version_conflict,
            on_merge_conflict,
        }
    }
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self::new(OnVersionConflict::Error, OnMergeConflict::Error)
    }
}

/// A batch of feature writes and deletions sharing one update strategy.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Modification {
    pub update_strategy: UpdateStrategy,

    /// Features to insert or update.
    #[serde(default)]
    pub features: Vec<Feature>,

    /// Ids of features to delete.
    #[serde(default)]
    pub deleted_ids: Vec<String>,
}

impl Modification {
    /// Modification writing the given features.
    pub fn write(features: Vec<Feature>) -> Self {
        Self {
            features,
            ..Default::default()
        }
    }

    /// Modification deleting the given feature ids.
    pub fn delete(ids: Vec<String>) -> Self {
        Self {
            deleted_ids: ids,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.deleted_ids.is_empty()
    }
}

/// Modifications committed at one version of one branch.
///
/// A changeset delivered by the history iterator may be a fragment: several
/// consecutive changesets with the same version form one logical changeset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub version: u64,
    pub author: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub inserted: Vec<Feature>,
    #[serde(default)]
    pub updated: Vec<Feature>,
    #[serde(default)]
    pub deleted: Vec<Feature>,
}

impl Changeset {
    pub fn new(version: u64, author: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            version,
            author: author.into(),
            created_at,
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Number of features touched by this changeset.
    pub fn feature_count(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feature_count() == 0
    }

    /// Turn the changeset back into writable modifications.
    ///
    /// Inserted and updated features become one write modification, deleted
    /// features one delete modification. Empty parts are left out.
    pub fn to_modifications(
        &self,
        on_version_conflict: OnVersionConflict,
        on_merge_conflict: OnMergeConflict,
    ) -> Vec<Modification> {
        let strategy = UpdateStrategy::new(on_version_conflict, on_merge_conflict);
        let mut modifications = Vec::with_capacity(2);

        let written: Vec<Feature> = self
            .inserted
            .iter()
            .chain(self.updated.iter())
            .cloned()
            .collect();
        if !written.is_empty() {
            modifications.push(Modification::write(written).with_strategy(strategy));
        }

        if !self.deleted.is_empty() {
            let ids = self.deleted.iter().map(|f| f.id.clone()).collect();
            modifications.push(Modification::delete(ids).with_strategy(strategy));
        }

        modifications
    }

    /// Append a fragment of the same version to this changeset.
    pub fn absorb(&mut self, fragment: Changeset) {
        debug_assert_eq!(self.version, fragment.version);
        self.inserted.extend(fragment.inserted);
        self.updated.extend(fragment.updated);
        self.deleted.extend(fragment.deleted);
        if fragment.created_at > self.created_at {
            self.created_at = fragment.created_at;
        }
    }
}

/// Outcome of one commit: how many modifications were applied and how many
/// of them hit a version or merge conflict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub count: u64,
    pub conflicting: u64,
}

impl CommitResult {
    pub fn has_conflicts(&self) -> bool {
        self.conflicting > 0
    }
}

impl AddAssign for CommitResult {
    fn add_assign(&mut self, other: Self) {
        self.count += other.count;
        self.conflicting += other.conflicting;
    }
}

/// Accessors common to the results of structural branch operations.
pub trait OperationOutcome {
    /// The node callers should continue to work with.
    fn node_id(&self) -> NodeId;
    /// The base ref of that node.
    fn base_ref(&self) -> &Ref;
    /// Whether conflicts are waiting to be resolved on that node.
    fn conflicting(&self) -> bool;
}

/// Result of a rebase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchOperationResult {
    pub node_id: NodeId,
    pub base_ref: Ref,
    pub conflicting: bool,
}

impl OperationOutcome for BranchOperationResult {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn base_ref(&self) -> &Ref {
        &self.base_ref
    }

    fn conflicting(&self) -> bool {
        self.conflicting
    }
}

/// Result of a merge.
///
/// When `conflicting` is set, `node_id` is the temporary branch holding the
/// squashed (conflicting) merge commit and `base_ref` is the resolved target
/// HEAD it was based on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeOperationResult {
    pub node_id: NodeId,
    pub base_ref: Ref,
    pub conflicting: bool,
    /// HEAD version of the source branch that was merged.
    pub merged_source_version: u64,
    /// Version the merge commit has (or would have) in the target branch.
    pub resolved_merge_target_ref: Ref,
}

impl OperationOutcome for MergeOperationResult {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn base_ref(&self) -> &Ref {
        &self.base_ref
    }

    fn conflicting(&self) -> bool {
        self.conflicting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_modifications_splits_writes_and_deletes() {
        let mut changeset = Changeset::new(7, "alice", Timestamp(1));
        changeset.inserted.push(Feature::new("a"));
        changeset.updated.push(Feature::new("b"));
        changeset.deleted.push(Feature::new("c"));

        let mods = changeset.to_modifications(OnVersionConflict::Merge, OnMergeConflict::Continue);
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0].features.len(), 2);
        assert_eq!(mods[1].deleted_ids, vec!["c".to_string()]);
        assert_eq!(mods[0].update_strategy.on_merge_conflict, OnMergeConflict::Continue);
    }

    #[test]
    fn test_to_modifications_skips_empty_parts() {
        let mut changeset = Changeset::new(1, "bob", Timestamp(1));
        changeset.deleted.push(Feature::new("x"));

        let mods = changeset.to_modifications(OnVersionConflict::Merge, OnMergeConflict::Error);
        assert_eq!(mods.len(), 1);
        assert!(mods[0].features.is_empty());
    }

    #[test]
    fn test_absorb_fragment() {
        let mut first = Changeset::new(3, "alice", Timestamp(10));
        first.inserted.push(Feature::new("a"));
        let mut second = Changeset::new(3, "alice", Timestamp(20));
        second.updated.push(Feature::new("b"));

        first.absorb(second);
        assert_eq!(first.feature_count(), 2);
        assert_eq!(first.created_at, Timestamp(20));
    }

    #[test]
    fn test_commit_result_accumulates() {
        let mut total = CommitResult::default();
        total += CommitResult { count: 3, conflicting: 0 };
        total += CommitResult { count: 2, conflicting: 1 };
        assert_eq!(total, CommitResult { count: 5, conflicting: 1 });
        assert!(total.has_conflicts());
    }

    #[test]
    fn test_commit_result_from_row() {
        let row = json!({"count": 4, "conflicting": 2});
        let result: CommitResult = serde_json::from_value(row).unwrap();
        assert_eq!(result.count, 4);
        assert_eq!(result.conflicting, 2);
    }

    #[test]
    fn test_feature_builder() {
        let feature = Feature::new("f1")
            .with_property("name", "road")
            .with_geometry(json!({"type": "Point", "coordinates": [1.0, 2.0]}));
        assert_eq!(feature.properties["name"], "road");
        assert!(feature.geometry.is_some());
    }
}

//! Integration tests for squash merges.

use serde_json::Value;
use space_branching::{
    BackendError, BackendResult, BranchEvent, BranchManager, ChangesetPage, ChangesetQuery,
    ChangesetSource, EngineConfig, EngineError, Feature, FeatureWriter, MemoryBackend,
    Modification, NodeId, Ref, SequenceStore, TableCatalog, TableSpec, WriteRequest,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn setup() -> (Arc<MemoryBackend>, BranchManager) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let backend = Arc::new(MemoryBackend::new());
    backend.create_space("public", "space").unwrap();
    let manager =
        BranchManager::open(backend.clone(), EngineConfig::for_space("public", "space")).unwrap();
    (backend, manager)
}

fn commit(manager: &BranchManager, node_id: NodeId, features: Vec<Feature>) {
    manager
        .write_commit(node_id, vec![Modification::write(features)], "tester", &Ref::head(), None)
        .unwrap();
}

fn head(manager: &BranchManager, node_id: NodeId) -> u64 {
    manager
        .resolve_head(&BranchManager::head_ref(node_id))
        .unwrap()
        .version()
        .unwrap()
}

fn read(backend: &MemoryBackend, manager: &BranchManager, node_id: NodeId, id: &str) -> Option<Feature> {
    let chain = manager.commits().table_chain(node_id).unwrap();
    backend
        .read_feature("public", &chain.tables, &chain.base_versions, id)
        .unwrap()
}

#[test]
fn test_squash_merge_into_main() {
    let (backend, manager) = setup();
    commit(&manager, 0, vec![Feature::new("a")]);
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();

    commit(&manager, node, vec![Feature::new("b").with_property("lanes", 1)]);
    commit(&manager, node, vec![Feature::new("c")]);
    commit(&manager, node, vec![Feature::new("b").with_property("lanes", 2)]);
    commit(&manager, 0, vec![Feature::new("d")]);

    let handle = manager.context().events().subscribe_default();
    let result = manager.merge(node, &Ref::main(1), 0, false).unwrap();

    assert!(!result.conflicting);
    assert_eq!(result.node_id, node);
    assert_eq!(result.base_ref, Ref::main(1));
    assert_eq!(result.merged_source_version, 4);
    assert_eq!(result.resolved_merge_target_ref, Ref::main(3));

    // One squashed version on top of the target's HEAD
    assert_eq!(head(&manager, 0), 3);
    assert_eq!(backend.versions("public", "space").unwrap(), vec![1, 2, 3]);
    assert_eq!(
        read(&backend, &manager, 0, "b").unwrap().properties["lanes"],
        2
    );
    assert!(read(&backend, &manager, 0, "c").is_some());

    // The temporary branch is gone, the source stays
    assert_eq!(manager.context().lineage().nodes(), vec![node]);
    assert_eq!(backend.list_tables("public").unwrap().len(), 2);

    let merged = handle
        .drain()
        .into_iter()
        .find(|e| matches!(e, BranchEvent::Merged { .. }));
    assert_eq!(
        merged,
        Some(BranchEvent::Merged {
            source_node_id: node,
            target_node_id: 0,
            merge_ref: Ref::main(3),
        })
    );

    // Commits after the merge continue above it
    commit(&manager, 0, vec![Feature::new("e")]);
    assert_eq!(head(&manager, 0), 4);
}

#[test]
fn test_merge_without_changes_is_noop() {
    let (backend, manager) = setup();
    commit(&manager, 0, vec![Feature::new("a")]);
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();
    commit(&manager, 0, vec![Feature::new("b")]);

    let result = manager.merge(node, &Ref::main(1), 0, false).unwrap();

    assert!(!result.conflicting);
    assert_eq!(result.merged_source_version, 1);
    assert_eq!(head(&manager, 0), 2);
    assert_eq!(manager.context().lineage().nodes(), vec![node]);
    assert_eq!(backend.list_tables("public").unwrap().len(), 2);
}

#[test]
fn test_merge_pauses_on_conflict() {
    let (backend, manager) = setup();
    commit(&manager, 0, vec![Feature::new("a").with_property("x", 1)]);
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();

    commit(&manager, node, vec![Feature::new("a").with_property("x", 2)]);
    commit(&manager, 0, vec![Feature::new("a").with_property("x", 3)]);

    let handle = manager.context().events().subscribe_default();
    let result = manager.merge(node, &Ref::main(1), 0, false).unwrap();

    assert!(result.conflicting);
    assert_ne!(result.node_id, node);
    assert_eq!(result.base_ref, Ref::main(2));
    assert_eq!(result.resolved_merge_target_ref, Ref::main(3));

    // Target untouched, the temporary branch holds the conflicting state
    let tmp = result.node_id;
    assert_eq!(head(&manager, 0), 2);
    assert_eq!(head(&manager, tmp), 3);
    let tmp_table = manager.branch_table_name(tmp).unwrap();
    assert_eq!(
        backend.conflicting_features("public", &tmp_table).unwrap(),
        vec!["a".to_string()]
    );
    assert_eq!(read(&backend, &manager, 0, "a").unwrap().properties["x"], 3);

    assert!(handle.drain().contains(&BranchEvent::MergePaused {
        source_node_id: node,
        tmp_node_id: tmp,
        merge_ref: Ref::main(3),
    }));
}

#[test]
fn test_merge_combines_concurrent_property_edits() {
    let (backend, manager) = setup();
    commit(&manager, 0, vec![Feature::new("a").with_property("x", 1)]);
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();

    commit(&manager, node, vec![Feature::new("a").with_property("x", 1).with_property("y", 2)]);
    commit(&manager, 0, vec![Feature::new("a").with_property("x", 5)]);

    let result = manager.merge(node, &Ref::main(1), 0, false).unwrap();
    assert!(!result.conflicting);

    let merged = read(&backend, &manager, 0, "a").unwrap();
    assert_eq!(merged.properties["x"], 5);
    assert_eq!(merged.properties["y"], 2);
    assert_eq!(head(&manager, 0), 3);
}

#[test]
fn test_merge_deletions() {
    let (backend, manager) = setup();
    commit(&manager, 0, vec![Feature::new("a"), Feature::new("b")]);
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();

    manager
        .write_commit(node, vec![Modification::delete(vec!["a".into()])], "tester", &Ref::head(), None)
        .unwrap();

    let result = manager.merge(node, &Ref::main(1), 0, false).unwrap();
    assert!(!result.conflicting);
    assert!(read(&backend, &manager, 0, "a").is_none());
    assert!(read(&backend, &manager, 0, "b").is_some());
}

#[test]
fn test_merge_insert_then_delete_leaves_nothing() {
    let (backend, manager) = setup();
    commit(&manager, 0, vec![Feature::new("a")]);
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();

    commit(&manager, node, vec![Feature::new("x"), Feature::new("y")]);
    manager
        .write_commit(node, vec![Modification::delete(vec!["x".into()])], "tester", &Ref::head(), None)
        .unwrap();
    assert!(read(&backend, &manager, node, "x").is_none());

    let result = manager.merge(node, &Ref::main(1), 0, false).unwrap();
    assert!(!result.conflicting);
    assert_eq!(head(&manager, 0), 2);
    assert!(read(&backend, &manager, 0, "x").is_none());
    assert!(read(&backend, &manager, 0, "y").is_some());
    assert_eq!(manager.context().lineage().nodes(), vec![node]);
}

#[test]
fn test_merge_of_cancelled_insert_is_noop() {
    let (backend, manager) = setup();
    commit(&manager, 0, vec![Feature::new("a")]);
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();

    commit(&manager, node, vec![Feature::new("x")]);
    manager
        .write_commit(node, vec![Modification::delete(vec!["x".into()])], "tester", &Ref::head(), None)
        .unwrap();

    let result = manager.merge(node, &Ref::main(1), 0, false).unwrap();
    assert!(!result.conflicting);
    assert_eq!(head(&manager, 0), 1);
    assert!(read(&backend, &manager, 0, "x").is_none());
    assert_eq!(manager.context().lineage().nodes(), vec![node]);
}

/// Commits `a x=3` to main right before the first explicit-version write
/// into main, like a concurrent writer racing the merge copy.
struct RacingBackend {
    inner: MemoryBackend,
    raced: AtomicBool,
}

impl TableCatalog for RacingBackend {
    fn list_tables(&self, schema: &str) -> BackendResult<Vec<String>> {
        self.inner.list_tables(schema)
    }

    fn create_table(&self, schema: &str, table: &str, spec: &TableSpec) -> BackendResult<()> {
        self.inner.create_table(schema, table, spec)
    }

    fn drop_table(&self, schema: &str, table: &str) -> BackendResult<()> {
        self.inner.drop_table(schema, table)
    }

    fn max_version(&self, schema: &str, table: &str) -> BackendResult<u64> {
        self.inner.max_version(schema, table)
    }
}

impl SequenceStore for RacingBackend {
    fn next_value(&self, schema: &str, sequence: &str) -> BackendResult<u64> {
        self.inner.next_value(schema, sequence)
    }

    fn set_value(&self, schema: &str, sequence: &str, value: u64) -> BackendResult<()> {
        self.inner.set_value(schema, sequence, value)
    }
}

impl FeatureWriter for RacingBackend {
    fn write_features(&self, request: &WriteRequest) -> BackendResult<Vec<Value>> {
        let into_main = request.tables.len() == 1 && request.tables[0] == "space";
        if into_main && request.version.is_some() && !self.raced.swap(true, Ordering::SeqCst) {
            let racing = WriteRequest {
                modifications: vec![Modification::write(vec![Feature::new("a").with_property("x", 3)])],
                author: "racer".to_string(),
                base_version: None,
                version: None,
                replay_floor: None,
                ..request.clone()
            };
            self.inner.write_features(&racing)?;
        }
        self.inner.write_features(request)
    }
}

impl ChangesetSource for RacingBackend {
    fn query_changesets(&self, query: &ChangesetQuery) -> BackendResult<ChangesetPage> {
        self.inner.query_changesets(query)
    }
}

#[test]
fn test_merge_copy_detects_concurrent_target_change() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let inner = MemoryBackend::new();
    inner.create_space("public", "space").unwrap();
    let backend = Arc::new(RacingBackend {
        inner,
        raced: AtomicBool::new(false),
    });
    let manager =
        BranchManager::open(backend.clone(), EngineConfig::for_space("public", "space")).unwrap();

    commit(&manager, 0, vec![Feature::new("a").with_property("x", 1)]);
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();
    commit(&manager, node, vec![Feature::new("a").with_property("x", 2)]);

    let err = manager.merge(node, &Ref::main(1), 0, false).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Backend(BackendError::Conflict { .. })
    ));
    assert!(backend.raced.load(Ordering::SeqCst));

    // Only the racing commit reached main
    let chain = manager.commits().table_chain(0).unwrap();
    let a = backend
        .inner
        .read_feature("public", &chain.tables, &chain.base_versions, "a")
        .unwrap()
        .unwrap();
    assert_eq!(a.properties["x"], 3);
}

#[test]
fn test_merge_into_branch() {
    let (backend, manager) = setup();
    commit(&manager, 0, vec![Feature::new("a")]);
    let parent = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();
    commit(&manager, parent, vec![Feature::new("p")]);

    let child = manager
        .create_branch(&BranchManager::head_ref(parent))
        .unwrap()
        .node_id()
        .unwrap();
    commit(&manager, child, vec![Feature::new("c1")]);
    commit(&manager, child, vec![Feature::new("c2")]);

    let base = manager.base_ref(child).unwrap();
    assert_eq!(base, Ref::node(parent, 2));

    let result = manager.merge(child, &base, parent, false).unwrap();
    assert!(!result.conflicting);
    assert_eq!(result.resolved_merge_target_ref, Ref::node(parent, 3));
    assert_eq!(head(&manager, parent), 3);
    assert!(read(&backend, &manager, parent, "c1").is_some());
    assert!(read(&backend, &manager, parent, "c2").is_some());

    // main never sees it
    assert!(read(&backend, &manager, 0, "c1").is_none());
    assert_eq!(head(&manager, 0), 1);
}

#[test]
fn test_fast_forward_unsupported() {
    let (backend, manager) = setup();
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();
    let tables = backend.list_tables("public").unwrap().len();

    let err = manager.merge(node, &Ref::main(0), 0, true).unwrap_err();
    assert!(matches!(err, EngineError::Unsupported(_)));
    assert_eq!(backend.list_tables("public").unwrap().len(), tables);
}

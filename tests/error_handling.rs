//! Error handling tests: every refusal surfaces as a typed error and leaves
//! the store as it was.

use space_branching::{
    BackendError, BranchManager, EngineConfig, EngineError, Feature, MemoryBackend, Modification,
    Ref, TableCatalog, UpdateStrategy,
};
use std::sync::Arc;

fn setup() -> (Arc<MemoryBackend>, BranchManager) {
    let backend = Arc::new(MemoryBackend::new());
    backend.create_space("public", "space").unwrap();
    let manager =
        BranchManager::open(backend.clone(), EngineConfig::for_space("public", "space")).unwrap();
    (backend, manager)
}

fn commit(manager: &BranchManager, node_id: u32, feature: Feature) {
    manager
        .write_commit(node_id, vec![Modification::write(vec![feature])], "tester", &Ref::head(), None)
        .unwrap();
}

// --- Configuration ---

#[test]
fn test_invalid_root_table_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let result = BranchManager::open(backend, EngineConfig::for_space("public", "bad name; drop"));
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

#[test]
fn test_zero_page_size_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig::for_space("public", "space").with_page_size(0);
    assert!(matches!(
        BranchManager::open(backend, config),
        Err(EngineError::InvalidConfig(_))
    ));
}

// --- Refs ---

#[test]
fn test_malformed_refs() {
    for input in ["", "~", "~x", "~1:abc", "~1:5..2", "1bad", "a b"] {
        let parsed = input.parse::<Ref>();
        assert!(
            matches!(parsed, Err(EngineError::InvalidRef(_))),
            "{:?} parsed as {:?}",
            input,
            parsed
        );
    }
}

#[test]
fn test_named_ref_needs_resolution() {
    let (backend, manager) = setup();
    let named: Ref = "feature-x".parse().unwrap();

    let err = manager.create_branch(&named).unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    assert!(err.to_string().contains("not resolved to a node ID"));
    assert_eq!(backend.list_tables("public").unwrap(), vec!["space".to_string()]);
}

// --- Branches ---

#[test]
fn test_future_base_version_rejected() {
    let (backend, manager) = setup();
    commit(&manager, 0, Feature::new("a"));

    let err = manager.create_branch(&Ref::main(2)).unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    assert!(err.to_string().contains("HEAD=1"));
    assert_eq!(backend.list_tables("public").unwrap().len(), 1);
}

#[test]
fn test_unknown_node() {
    let (_, manager) = setup();

    let err = manager.create_branch(&Ref::node(42, 0)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Backend(BackendError::TableNotFound(42))
    ));
    assert_eq!(err.to_string(), "Unable to find table for node ID 42");

    assert!(manager.branch_table_name(42).is_err());
    assert!(manager
        .write_commit(42, vec![Modification::write(vec![Feature::new("a")])], "t", &Ref::head(), None)
        .unwrap_err()
        .is_backend());
}

#[test]
fn test_main_has_no_base_ref() {
    let (_, manager) = setup();
    assert!(matches!(
        manager.base_ref(0),
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(!manager.delete_branch(0).unwrap());
}

#[test]
fn test_rebase_needs_concrete_base() {
    let (backend, manager) = setup();
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();
    let tables = backend.list_tables("public").unwrap().len();

    let err = manager.rebase(node, &Ref::head(), &Ref::head()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    assert_eq!(backend.list_tables("public").unwrap().len(), tables);
}

// --- Commits ---

#[test]
fn test_stale_commit_with_error_strategy() {
    let (backend, manager) = setup();
    commit(&manager, 0, Feature::new("a").with_property("x", 1));
    commit(&manager, 0, Feature::new("a").with_property("x", 2));

    let err = manager
        .write_commit(
            0,
            vec![Modification::write(vec![Feature::new("a").with_property("x", 3)])
                .with_strategy(UpdateStrategy::default())],
            "tester",
            &Ref::main(1),
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Backend(BackendError::Conflict { ref feature_id, .. }) if feature_id == "a"
    ));

    // Nothing of the failed batch was stored
    assert_eq!(backend.row_count("public", "space").unwrap(), 2);
}

#[test]
fn test_explicit_version_not_above_base() {
    let (_, manager) = setup();
    commit(&manager, 0, Feature::new("a"));
    let node = manager.create_branch(&Ref::head()).unwrap().node_id().unwrap();

    // ~1 starts at 1, versions of its own start above that
    let err = manager
        .write_commit(node, vec![Modification::write(vec![Feature::new("b")])], "t", &Ref::head(), Some(1))
        .unwrap_err();
    assert!(err.is_backend());
}

// --- History ---

#[test]
fn test_history_argument_checks() {
    let (_, manager) = setup();
    commit(&manager, 0, Feature::new("a"));
    commit(&manager, 0, Feature::new("b"));
    let history = manager.history();

    assert!(matches!(
        history.iterate_changesets(&Ref::head(), &Ref::head()),
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        history.iterate_changesets(&Ref::main(2), &Ref::main(1)),
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        history.iterate_changesets(&Ref::main(0), &Ref::range(0, 0, None)),
        Err(EngineError::InvalidArgument(_))
    ));

    let all = history.collect_logical(&Ref::main(0), &Ref::head()).unwrap();
    assert_eq!(all.iter().map(|c| c.version).collect::<Vec<_>>(), vec![1, 2]);
}

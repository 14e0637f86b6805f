//! History manager implementation.

use super::iterator::ChangesetIterator;
use crate::backend::ChangesetQuery;
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::refs::Ref;
use crate::types::Changeset;
use std::sync::Arc;
use tracing::debug;

/// Reads committed changesets between two refs.
pub struct HistoryManager {
    context: Arc<EngineContext>,
}

impl HistoryManager {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    /// Changesets after `start` up to and including `end`.
    ///
    /// `start` must point to a concrete version; `end` may be HEAD. The
    /// versions are absolute, `start.version` itself is not included.
    pub fn iterate_changesets(&self, start: &Ref, end: &Ref) -> Result<ChangesetIterator> {
        let start_version = start.require_version()?;
        if end.is_range() {
            return Err(EngineError::InvalidArgument(format!(
                "History end ref must not be a range: {}",
                end
            )));
        }
        let start_node = start.node_id()?;
        let end_node = end.node_id()?;

        let end_version = end.version();
        if let Some(end_version) = end_version {
            if end_version < start_version {
                return Err(EngineError::InvalidArgument(format!(
                    "History range ends before it starts: {}..{}",
                    start, end
                )));
            }
        }

        let config = self.context.config();
        let query = ChangesetQuery {
            schema: config.schema.clone(),
            root_table: config.root_table.clone(),
            space_id: config.space_id.clone(),
            range: Ref::range(end_node, start_version, end_version),
            branch_path: self.context.branch_path(start_node, end_node)?,
            page_size: config.page_size,
            page_token: None,
            node_id: end_node,
            min_version: config.retention_min_version,
        };

        debug!(
            stream_id = %config.stream_id,
            range = %query.range,
            path_len = query.branch_path.len(),
            "Iterating changesets"
        );
        Ok(ChangesetIterator::new(self.context.clone(), query))
    }

    /// All changesets of a range with page fragments folded together.
    pub fn collect_logical(&self, start: &Ref, end: &Ref) -> Result<Vec<Changeset>> {
        let mut changesets: Vec<Changeset> = Vec::new();
        for fragment in self.iterate_changesets(start, end)? {
            let fragment = fragment?;
            match changesets.last_mut() {
                Some(last) if last.version == fragment.version => last.absorb(fragment),
                _ => changesets.push(fragment),
            }
        }
        Ok(changesets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, TableSpec, TableCatalog};
    use crate::commits::CommitManager;
    use crate::config::EngineConfig;
    use crate::types::{Feature, Modification};

    struct Fixture {
        commits: CommitManager,
        history: HistoryManager,
    }

    fn fixture(page_size: usize, tables: &[&str]) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_space("public", "space").unwrap();
        for table in tables {
            backend.create_table("public", table, &TableSpec::default()).unwrap();
        }
        let config = EngineConfig::default().with_page_size(page_size);
        let context = Arc::new(EngineContext::new(backend, config).unwrap());
        Fixture {
            commits: CommitManager::new(context.clone()),
            history: HistoryManager::new(context),
        }
    }

    fn commit(fixture: &Fixture, node: u32, ids: &[&str]) {
        let features = ids.iter().map(|id| Feature::new(*id)).collect();
        fixture
            .commits
            .write_commit(node, vec![Modification::write(features)], "tester", None, None)
            .unwrap();
    }

    #[test]
    fn test_start_is_exclusive() {
        let fixture = fixture(100, &[]);
        commit(&fixture, 0, &["a"]);
        commit(&fixture, 0, &["b"]);
        commit(&fixture, 0, &["c"]);

        let versions: Vec<u64> = fixture
            .history
            .iterate_changesets(&Ref::main(1), &Ref::head())
            .unwrap()
            .map(|c| c.unwrap().version)
            .collect();
        assert_eq!(versions, vec![2, 3]);

        let bounded: Vec<u64> = fixture
            .history
            .iterate_changesets(&Ref::main(0), &Ref::main(2))
            .unwrap()
            .map(|c| c.unwrap().version)
            .collect();
        assert_eq!(bounded, vec![1, 2]);
    }

    #[test]
    fn test_pages_split_one_version() {
        let fixture = fixture(2, &[]);
        commit(&fixture, 0, &["a", "b", "c", "d", "e"]);

        let mut iter = fixture
            .history
            .iterate_changesets(&Ref::main(0), &Ref::head())
            .unwrap();
        let mut fragments = Vec::new();
        while iter.has_next().unwrap() {
            fragments.push(iter.next_changeset().unwrap().unwrap());
        }
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|c| c.version == 1));
        assert!(iter.next_changeset().unwrap().is_none());

        let logical = fixture
            .history
            .collect_logical(&Ref::main(0), &Ref::head())
            .unwrap();
        assert_eq!(logical.len(), 1);
        assert_eq!(logical[0].inserted.len(), 5);
    }

    #[test]
    fn test_branch_history_follows_path() {
        let fixture = fixture(100, &["space_0_1_1"]);
        commit(&fixture, 0, &["a"]);
        commit(&fixture, 1, &["b"]);
        commit(&fixture, 1, &["c"]);

        let from_fork = fixture
            .history
            .collect_logical(&Ref::main(1), &Ref::node_head(1))
            .unwrap();
        assert_eq!(from_fork.iter().map(|c| c.version).collect::<Vec<_>>(), vec![2, 3]);

        let from_start = fixture
            .history
            .collect_logical(&Ref::main(0), &Ref::node_head(1))
            .unwrap();
        assert_eq!(from_start.iter().map(|c| c.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_rejects_unresolved_start() {
        let fixture = fixture(100, &[]);
        assert!(matches!(
            fixture.history.iterate_changesets(&Ref::head(), &Ref::head()),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(fixture
            .history
            .iterate_changesets(&Ref::main(3), &Ref::main(2))
            .is_err());
    }
}

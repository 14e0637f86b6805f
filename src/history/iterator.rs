//! Lazy, paginated changeset iteration.

use crate::backend::ChangesetQuery;
use crate::context::EngineContext;
use crate::error::Result;
use crate::types::Changeset;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Iterates the changesets of a range, one backend page at a time.
///
/// Consecutive items may share a version when a changeset was split across
/// pages. Holds nothing but the current page and the continuation token, so
/// dropping it mid-way is fine.
pub struct ChangesetIterator {
    context: Arc<EngineContext>,
    query: ChangesetQuery,
    page: VecDeque<Changeset>,
    /// True until the first page was requested.
    fresh: bool,
    /// Set once the last page was loaded or a load failed.
    exhausted: bool,
}

impl ChangesetIterator {
    pub(super) fn new(context: Arc<EngineContext>, query: ChangesetQuery) -> Self {
        Self {
            context,
            query,
            page: VecDeque::new(),
            fresh: true,
            exhausted: false,
        }
    }

    /// The query sent to the changeset source (token of the next page included).
    pub fn query(&self) -> &ChangesetQuery {
        &self.query
    }

    /// True if another changeset is available. May load a page.
    pub fn has_next(&mut self) -> Result<bool> {
        while self.page.is_empty() {
            if self.exhausted || (!self.fresh && self.query.page_token.is_none()) {
                return Ok(false);
            }
            self.load_page()?;
        }
        Ok(true)
    }

    /// Next changeset (fragment), loading a page when needed.
    pub fn next_changeset(&mut self) -> Result<Option<Changeset>> {
        if !self.has_next()? {
            return Ok(None);
        }
        Ok(self.page.pop_front())
    }

    fn load_page(&mut self) -> Result<()> {
        self.fresh = false;
        let page = match self.context.backend().query_changesets(&self.query) {
            Ok(page) => page,
            Err(e) => {
                self.exhausted = true;
                return Err(e.into());
            }
        };

        trace!(
            range = %self.query.range,
            changesets = page.changesets.len(),
            more = page.next_page_token.is_some(),
            "Loaded changeset page"
        );

        // A source that hands back the token it was given would loop forever.
        if page.next_page_token.is_some() && page.next_page_token == self.query.page_token {
            self.exhausted = true;
        }
        self.page.extend(page.changesets);
        self.query.page_token = page.next_page_token;
        Ok(())
    }
}

impl Iterator for ChangesetIterator {
    type Item = Result<Changeset>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_changeset() {
            Ok(Some(changeset)) => Some(Ok(changeset)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

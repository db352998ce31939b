use tracing::{debug, warn};

use super::{Cursor, FetchScope, PageRequest};
use crate::cache::ListStore;
use crate::model::{Direction, ListItem};

/// What to do with an empty page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyOutcome {
    /// The local tier ran dry; escalate the same request to the remote tier
    /// before concluding anything about the end of data.
    RetryRemote,
    /// The remote tier is empty too: the end really is reached.
    EndReached,
}

/// Derives page requests from the store's boundary entries and decides how
/// fetch results affect the end-reached bookkeeping.
///
/// The local-miss escalation is mandatory, not an optimization: a filtered
/// source whose predicate rarely matches returns sparse local pages long
/// before the underlying data is exhausted, and treating that as end-of-data
/// would falsely freeze the collection.
#[derive(Debug, Default)]
pub struct Pager {
    forward_local_exhausted: bool,
    backward_local_exhausted: bool,
}

impl Pager {
    pub fn new() -> Self {
        Self::default()
    }

    fn local_exhausted(&self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.forward_local_exhausted,
            Direction::Backward => self.backward_local_exhausted,
        }
    }

    fn mark_local_exhausted(&mut self, direction: Direction) {
        match direction {
            Direction::Forward => self.forward_local_exhausted = true,
            Direction::Backward => self.backward_local_exhausted = true,
        }
    }

    /// Build the next request: cursor from the boundary entry in the
    /// requested direction, scope local until that tier ran dry.
    pub fn request<I: ListItem>(
        &self,
        store: &ListStore<I>,
        direction: Direction,
        limit: usize,
    ) -> PageRequest<I> {
        let boundary = match direction {
            Direction::Forward => store.last_entry(),
            Direction::Backward => store.first_entry(),
        };
        let cursor = boundary.map(|entry| Cursor {
            key: entry.key(),
            position: entry.position,
        });
        let scope = if self.local_exhausted(direction) {
            FetchScope::Remote
        } else {
            FetchScope::LocalCache
        };
        PageRequest {
            direction,
            cursor,
            limit,
            scope,
        }
    }

    /// An empty batch came back. Local-tier emptiness escalates; only a
    /// remote-tier empty page may declare the end reached.
    pub fn on_empty(
        &mut self,
        direction: Direction,
        scope: FetchScope,
        exhausted: bool,
    ) -> EmptyOutcome {
        match scope {
            FetchScope::LocalCache => {
                debug!(
                    target: "list_sync",
                    ?direction,
                    "local page empty; escalating to remote before declaring end"
                );
                self.mark_local_exhausted(direction);
                EmptyOutcome::RetryRemote
            }
            FetchScope::Remote => {
                if !exhausted {
                    warn!(
                        target: "list_sync",
                        ?direction,
                        "remote returned an empty page without an exhausted flag; treating as end"
                    );
                }
                EmptyOutcome::EndReached
            }
        }
    }

    /// A non-empty batch came back. Returns whether the store should mark
    /// the end reached in that direction.
    pub fn on_batch(&mut self, direction: Direction, scope: FetchScope, exhausted: bool) -> bool {
        match (scope, exhausted) {
            (FetchScope::LocalCache, true) => {
                self.mark_local_exhausted(direction);
                false
            }
            (FetchScope::Remote, true) => true,
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.forward_local_exhausted = false;
        self.backward_local_exhausted = false;
    }
}

//! In-memory comparator-sorted storage for one synchronized collection.
//!
//! [`ListStore`] keeps the entries, pagination flags and load-state machine.
//! It is a plain single-threaded structure; confinement to one execution
//! context is the manager actor's job, not the store's.

use std::cmp::Ordering;

use thiserror::Error;

use crate::model::ListItem;

mod list;

pub use list::{ListStore, Reposition};

/// The store's own snapshot of an item's ordering fields. Comparisons go
/// through the snapshot, never through the (source-mutable) item itself, so
/// the sort order cannot tear while an item is being updated.
#[derive(Clone)]
pub struct Entry<I: ListItem> {
    pub item: I,
    pub position: I::Position,
}

impl<I: ListItem> Entry<I> {
    pub fn new(item: I) -> Self {
        let position = item.position();
        Self { item, position }
    }

    pub fn key(&self) -> I::Key {
        self.item.key()
    }

    /// Ordering of `self` relative to the rank `(position, key)`.
    ///
    /// Entries sort by descending position, ties broken by descending key,
    /// which makes the comparator a strict total order: two entries can only
    /// compare equal if they share a key.
    pub fn rank_cmp(&self, position: &I::Position, key: &I::Key) -> Ordering {
        position
            .cmp(&self.position)
            .then_with(|| key.cmp(&self.key()))
    }
}

/// Collection load-state machine.
///
/// `Initializing → PartiallyLoaded → FullyLoaded`, with one legal backward
/// edge (`FullyLoaded → PartiallyLoaded` when the known total grows) and
/// `Destroyed` absorbing from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Initializing,
    PartiallyLoaded,
    FullyLoaded,
    Destroyed,
}

/// Contract violations on direct store mutation. `DuplicateKey` and
/// `NotFound` indicate a desynchronization bug upstream; the store treats a
/// broken ordered index as unrecoverable and stops accepting mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("an entry with this key is already present")]
    DuplicateKey,
    #[error("no entry with this key is present")]
    NotFound,
    #[error("the collection has been destroyed")]
    Destroyed,
}

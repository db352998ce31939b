use std::collections::HashMap;

use tracing::{debug, error};

use super::{Entry, LoadState, StoreError};
use crate::model::{ChangeCause, Direction, ItemFilter, ListItem};
use crate::subscription::ListEvent;

/// Outcome of [`ListStore::reposition`]. Consumers must be able to tell
/// "same slot, new data" from "slot changed", so the two never collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reposition {
    Changed { index: usize },
    Moved { from: usize, to: usize },
    /// The new rank falls past the loaded tail while more pages remain, so
    /// the entry left the loaded range; `Removed` was emitted.
    Departed { from: usize },
}

/// Comparator-sorted sequence of entries plus pagination state.
///
/// Mutations append structural events to an internal buffer; the owner
/// drains them with [`ListStore::drain_events`] after each operation and
/// fans them out, which keeps delivery order identical to mutation order.
pub struct ListStore<I: ListItem> {
    entries: Vec<Entry<I>>,
    positions: HashMap<I::Key, I::Position>,
    total_count: Option<usize>,
    state: LoadState,
    forward_end_reached: bool,
    backward_end_reached: bool,
    bidirectional: bool,
    available: bool,
    events: Vec<ListEvent<I>>,
}

impl<I: ListItem> ListStore<I> {
    /// A unidirectional store paginates from the head of the remote order,
    /// so its backward end is trivially reached from the start. Anchored
    /// (start-from-the-middle) collections pass `bidirectional = true`.
    pub fn new(bidirectional: bool) -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            total_count: None,
            state: LoadState::Initializing,
            forward_end_reached: false,
            backward_end_reached: !bidirectional,
            bidirectional,
            available: false,
            events: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn total_count(&self) -> Option<usize> {
        self.total_count
    }

    pub fn entries(&self) -> &[Entry<I>] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&Entry<I>> {
        self.entries.get(index)
    }

    pub fn first_entry(&self) -> Option<&Entry<I>> {
        self.entries.first()
    }

    pub fn last_entry(&self) -> Option<&Entry<I>> {
        self.entries.last()
    }

    pub fn position_of(&self, key: I::Key) -> Option<I::Position> {
        self.positions.get(&key).copied()
    }

    pub fn contains(&self, key: I::Key) -> bool {
        self.positions.contains_key(&key)
    }

    pub fn end_reached(&self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.forward_end_reached,
            Direction::Backward => self.backward_end_reached,
        }
    }

    /// True when no further fetch in `direction` can produce items.
    pub fn is_exhausted(&self, direction: Direction) -> bool {
        matches!(self.state, LoadState::FullyLoaded | LoadState::Destroyed)
            || self.end_reached(direction)
    }

    /// Point-in-time copy of the loaded items, optionally filtered.
    pub fn snapshot(&self, filter: Option<&ItemFilter<I>>) -> Vec<I> {
        match filter {
            None => self.entries.iter().map(|e| e.item.clone()).collect(),
            Some(filter) => self
                .entries
                .iter()
                .filter(|e| filter(&e.item))
                .map(|e| e.item.clone())
                .collect(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<ListEvent<I>> {
        std::mem::take(&mut self.events)
    }

    fn ensure_alive(&self) -> Result<(), StoreError> {
        if self.state == LoadState::Destroyed {
            Err(StoreError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// The ordered index and the identity map disagree. Every subsequent
    /// binary search depends on the sort invariant, so the collection stops
    /// mutating instead of continuing with a broken order.
    fn poison(&mut self, context: &'static str) {
        error!(target: "list_sync", context, "sorted-order invariant violated; destroying collection");
        self.set_state(LoadState::Destroyed);
    }

    fn set_state(&mut self, new: LoadState) {
        if self.state == new {
            return;
        }
        let legal = matches!(
            (self.state, new),
            (LoadState::Initializing, LoadState::PartiallyLoaded)
                | (LoadState::PartiallyLoaded, LoadState::FullyLoaded)
                | (LoadState::FullyLoaded, LoadState::PartiallyLoaded)
                | (_, LoadState::Destroyed)
        );
        if !legal {
            error!(target: "list_sync", from = ?self.state, to = ?new, "illegal load-state transition ignored");
            return;
        }
        let old = self.state;
        self.state = new;
        self.events.push(ListEvent::LoadStateChanged { old, new });
    }

    fn refresh_availability(&mut self) {
        let now = !self.entries.is_empty() || self.total_count.map_or(false, |n| n > 0);
        if now != self.available {
            self.available = now;
            self.events.push(ListEvent::AvailabilityChanged(now));
        }
    }

    fn maybe_promote(&mut self) {
        if matches!(self.state, LoadState::FullyLoaded | LoadState::Destroyed) {
            return;
        }
        let complete = (self.forward_end_reached && self.backward_end_reached)
            || self.total_count == Some(self.entries.len());
        if complete {
            if self.state == LoadState::Initializing {
                self.set_state(LoadState::PartiallyLoaded);
            }
            self.set_state(LoadState::FullyLoaded);
        }
    }

    /// Called when the first page of a load cycle has been merged.
    pub fn note_chunk_loaded(&mut self) {
        if self.state == LoadState::Initializing {
            self.set_state(LoadState::PartiallyLoaded);
        }
        self.maybe_promote();
    }

    pub fn mark_end_reached(&mut self, direction: Direction) {
        match direction {
            Direction::Forward => self.forward_end_reached = true,
            Direction::Backward => self.backward_end_reached = true,
        }
        self.maybe_promote();
    }

    /// Insert at the comparator-resolved index. Fails on a duplicate key;
    /// that is a programmer-contract violation, not a recoverable condition.
    pub fn insert(&mut self, item: I) -> Result<usize, StoreError> {
        self.ensure_alive()?;
        let (index, entry) = self.resolve_insert(item)?;
        self.entries.insert(index, entry.clone());
        self.events.push(ListEvent::Added { entry, index });
        self.refresh_availability();
        Ok(index)
    }

    /// Insert a live-pushed item, skipping it (returning `None`) when its
    /// resolved index is the loaded tail and the forward end has not been
    /// reached: such an item belongs to a not-yet-loaded region and will
    /// arrive with a later page.
    pub fn insert_within_loaded(&mut self, item: I) -> Result<Option<usize>, StoreError> {
        self.ensure_alive()?;
        let (index, entry) = self.resolve_insert(item)?;
        if index == self.entries.len() && !self.forward_end_reached {
            self.positions.remove(&entry.key());
            return Ok(None);
        }
        self.entries.insert(index, entry.clone());
        self.events.push(ListEvent::Added { entry, index });
        self.refresh_availability();
        Ok(Some(index))
    }

    fn resolve_insert(&mut self, item: I) -> Result<(usize, Entry<I>), StoreError> {
        let key = item.key();
        if self.positions.contains_key(&key) {
            return Err(StoreError::DuplicateKey);
        }
        let entry = Entry::new(item);
        let index = match self
            .entries
            .binary_search_by(|e| e.rank_cmp(&entry.position, &key))
        {
            Ok(_) => return Err(StoreError::DuplicateKey),
            Err(index) => index,
        };
        self.positions.insert(key, entry.position);
        Ok((index, entry))
    }

    /// Merge a fetched page. Duplicates (page overlap at a boundary) are
    /// skipped silently. A contiguous run lands as one batched `ItemsAdded`
    /// so bulk consumers do not thrash; anything else degrades to per-item
    /// `Added` events. Returns the number of entries actually inserted.
    pub fn insert_batch(&mut self, items: Vec<I>, initial_chunk: bool) -> usize {
        if self.state == LoadState::Destroyed {
            return 0;
        }
        let mut inserted: Vec<(usize, Entry<I>)> = Vec::new();
        for item in items {
            match self.resolve_insert(item) {
                Ok((index, entry)) => {
                    self.entries.insert(index, entry.clone());
                    inserted.push((index, entry));
                }
                Err(StoreError::DuplicateKey) => {
                    debug!(target: "list_sync", "skipping duplicate entry in fetched page");
                }
                Err(_) => return inserted.len(),
            }
        }
        if inserted.is_empty() {
            return 0;
        }
        let start = inserted[0].0;
        let contiguous = inserted
            .iter()
            .enumerate()
            .all(|(offset, (index, _))| *index == start + offset);
        if contiguous {
            let entries: Vec<Entry<I>> = inserted.into_iter().map(|(_, e)| e).collect();
            let count = entries.len();
            self.events.push(ListEvent::ItemsAdded {
                entries,
                start_index: start,
                initial_chunk,
            });
            self.refresh_availability();
            count
        } else {
            // Indices were recorded at insertion time, so replaying them in
            // order is exactly the sequential contract listeners expect.
            let count = inserted.len();
            for (index, entry) in inserted {
                self.events.push(ListEvent::Added { entry, index });
            }
            self.refresh_availability();
            count
        }
    }

    pub fn remove(&mut self, key: I::Key) -> Result<usize, StoreError> {
        self.ensure_alive()?;
        let position = match self.positions.get(&key) {
            Some(position) => *position,
            None => return Err(StoreError::NotFound),
        };
        let index = match self
            .entries
            .binary_search_by(|e| e.rank_cmp(&position, &key))
        {
            Ok(index) => index,
            Err(_) => {
                self.poison("ordered index lost a key the identity map still holds");
                return Err(StoreError::NotFound);
            }
        };
        self.positions.remove(&key);
        let entry = self.entries.remove(index);
        self.events.push(ListEvent::Removed { entry, index });
        self.refresh_availability();
        Ok(index)
    }

    /// Move an entry to the index its new ordering fields resolve to.
    ///
    /// Equal ordering fields, or a new index equal to the old one, degrade
    /// to a position update plus `Changed`; only a real slot change emits
    /// `Moved`. A new rank past the loaded tail while the forward end is
    /// unreached drops the entry from the loaded range (`Departed` plus a
    /// `Removed` event): keeping it there would assert adjacency across an
    /// unloaded gap, and a later page brings it back at its true slot.
    pub fn reposition(
        &mut self,
        key: I::Key,
        position: I::Position,
        cause: ChangeCause,
    ) -> Result<Reposition, StoreError> {
        self.ensure_alive()?;
        let old_position = match self.positions.get(&key) {
            Some(position) => *position,
            None => return Err(StoreError::NotFound),
        };
        let from = match self
            .entries
            .binary_search_by(|e| e.rank_cmp(&old_position, &key))
        {
            Ok(index) => index,
            Err(_) => {
                self.poison("ordered index lost a key the identity map still holds");
                return Err(StoreError::NotFound);
            }
        };
        if old_position == position {
            let entry = self.entries[from].clone();
            self.events.push(ListEvent::Changed {
                entry,
                index: from,
                cause,
            });
            return Ok(Reposition::Changed { index: from });
        }
        let mut entry = self.entries.remove(from);
        entry.position = position;
        let to = match self
            .entries
            .binary_search_by(|e| e.rank_cmp(&position, &key))
        {
            Ok(index) => {
                self.poison("two entries resolved to the same rank");
                index
            }
            Err(index) => index,
        };
        if to == self.entries.len() && !self.forward_end_reached {
            self.positions.remove(&key);
            self.events.push(ListEvent::Removed { entry, index: from });
            self.refresh_availability();
            return Ok(Reposition::Departed { from });
        }
        self.entries.insert(to, entry.clone());
        self.positions.insert(key, position);
        if to == from {
            self.events.push(ListEvent::Changed {
                entry,
                index: to,
                cause,
            });
            Ok(Reposition::Changed { index: to })
        } else {
            self.events.push(ListEvent::Moved { entry, from, to });
            Ok(Reposition::Moved { from, to })
        }
    }

    /// Swap an entry's item payload without emitting anything. The position
    /// snapshot is kept; callers reposition first when ordering fields moved.
    pub fn replace_item(&mut self, key: I::Key, item: I) -> Result<usize, StoreError> {
        self.ensure_alive()?;
        let index = self.index_of(key).ok_or(StoreError::NotFound)?;
        self.entries[index].item = item;
        Ok(index)
    }

    /// Emit `Changed` for an entry at its current index.
    pub fn touch(&mut self, key: I::Key, cause: ChangeCause) -> Result<usize, StoreError> {
        self.ensure_alive()?;
        let index = self.index_of(key).ok_or(StoreError::NotFound)?;
        let entry = self.entries[index].clone();
        self.events.push(ListEvent::Changed {
            entry,
            index,
            cause,
        });
        Ok(index)
    }

    pub fn index_of(&self, key: I::Key) -> Option<usize> {
        let position = *self.positions.get(&key)?;
        self.entries
            .binary_search_by(|e| e.rank_cmp(&position, &key))
            .ok()
    }

    /// Update the known total. Demotes `FullyLoaded` back to
    /// `PartiallyLoaded` when the total outgrew the loaded count: the
    /// end-reached flags were the evidence for completeness, so they are
    /// cleared along with it.
    pub fn set_total_count(&mut self, total: Option<usize>) {
        if self.state == LoadState::Destroyed {
            return;
        }
        // A known total can never be below the loaded count.
        let total = total.map(|n| n.max(self.entries.len()));
        if total == self.total_count {
            return;
        }
        self.total_count = total;
        self.events.push(ListEvent::TotalCountChanged(total));
        if let Some(n) = total {
            if self.state == LoadState::FullyLoaded && n > self.entries.len() {
                self.forward_end_reached = false;
                if self.bidirectional {
                    self.backward_end_reached = false;
                }
                self.set_state(LoadState::PartiallyLoaded);
            }
        }
        self.maybe_promote();
        self.refresh_availability();
    }

    /// Adjust a known total by a push-add or push-remove without refetching.
    /// Unknown totals stay unknown.
    pub fn change_total_count(&mut self, delta: i64) {
        if let Some(n) = self.total_count {
            let next = (n as i64 + delta).max(self.entries.len() as i64);
            self.set_total_count(Some(next as usize));
        }
    }

    /// Collection-level metadata changed at the source.
    pub fn notify_metadata_changed(&mut self) {
        if self.state != LoadState::Destroyed {
            self.events.push(ListEvent::MetadataChanged);
        }
    }

    /// Full restart: drop everything and begin a new lifetime. Distinct from
    /// the state machine's forward-only edges; the caller bumps its epoch so
    /// in-flight responses from the old lifetime are discarded.
    pub fn reset(&mut self) {
        if self.state == LoadState::Destroyed {
            return;
        }
        self.entries.clear();
        self.positions.clear();
        self.forward_end_reached = false;
        self.backward_end_reached = !self.bidirectional;
        if self.total_count.is_some() {
            self.total_count = None;
            self.events.push(ListEvent::TotalCountChanged(None));
        }
        if self.state != LoadState::Initializing {
            let old = self.state;
            self.state = LoadState::Initializing;
            self.events.push(ListEvent::LoadStateChanged {
                old,
                new: LoadState::Initializing,
            });
        }
        self.refresh_availability();
    }

    /// Absorbing. Entries stay readable; all mutation is refused.
    pub fn destroy(&mut self) {
        self.set_state(LoadState::Destroyed);
    }
}

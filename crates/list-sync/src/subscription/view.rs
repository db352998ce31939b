use super::{ListEvent, ListListener};
use crate::cache::{Entry, ListStore};
use crate::model::{ItemFilter, ListItem};

/// Handle for one attached view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(pub u64);

/// A derived, read-mostly projection of a source collection: a predicate
/// restricts the entries, an ordered mirror indexes the matches, and only
/// the first `display_count` of them are exposed to the subscriber.
///
/// The view consumes the source's event stream and re-derives its own,
/// smaller one. Indices it reports are always view-space (positions within
/// the filtered mirror), never source indices. The no-filter case runs the
/// exact same path with a vacuous predicate.
///
/// While the initial chunk is being assembled nothing is delivered; the
/// first visible state transition a subscriber sees is a single complete
/// initial batch.
pub struct WindowedView<I: ListItem> {
    filter: Option<ItemFilter<I>>,
    subscriber: Box<dyn ListListener<I>>,
    filtered: Vec<Entry<I>>,
    display_count: usize,
    requested_window: usize,
    loading_initial: bool,
    available: bool,
}

impl<I: ListItem> WindowedView<I> {
    pub fn new(
        filter: Option<ItemFilter<I>>,
        subscriber: Box<dyn ListListener<I>>,
        initial_window: usize,
    ) -> Self {
        Self {
            filter,
            subscriber,
            filtered: Vec::new(),
            display_count: 0,
            requested_window: initial_window,
            loading_initial: true,
            available: false,
        }
    }

    /// Mirror whatever the source has already loaded. Called once at attach
    /// and again after a reset; delivery stays suppressed until
    /// [`WindowedView::finish_initial`].
    pub fn seed(&mut self, store: &ListStore<I>) {
        self.filtered = store
            .entries()
            .iter()
            .filter(|e| self.matches(&e.item))
            .cloned()
            .collect();
    }

    pub fn loading_initial(&self) -> bool {
        self.loading_initial
    }

    pub fn display_count(&self) -> usize {
        self.display_count
    }

    pub fn matched_count(&self) -> usize {
        self.filtered.len()
    }

    /// True while more matches are wanted than are currently indexed.
    pub fn needs_more(&self) -> bool {
        self.filtered.len() < self.requested_window
    }

    fn matches(&self, item: &I) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(item))
    }

    fn index_of_key(&self, key: I::Key) -> Option<usize> {
        // Linear on purpose: a moved entry's stored snapshot may be stale
        // relative to the event, and binary search on stale fields is
        // undefined. The mirror is window-sized, not collection-sized.
        self.filtered.iter().position(|e| e.key() == key)
    }

    fn binary_insert(&mut self, entry: Entry<I>) -> usize {
        let key = entry.key();
        let index = match self
            .filtered
            .binary_search_by(|e| e.rank_cmp(&entry.position, &key))
        {
            Ok(index) => return index,
            Err(index) => index,
        };
        self.filtered.insert(index, entry);
        index
    }

    /// Deliver the contiguous run of newly-in-window items as one batch and
    /// advance the window edge. No-op while the initial chunk is pending.
    fn dispatch(&mut self) {
        if self.loading_initial {
            return;
        }
        let target = self.requested_window.min(self.filtered.len());
        if self.display_count >= target {
            return;
        }
        let items: Vec<I> = self.filtered[self.display_count..target]
            .iter()
            .map(|e| e.item.clone())
            .collect();
        let start = self.display_count;
        self.display_count = target;
        self.subscriber.on_items_added(&items, start, false);
    }

    /// Deliver the assembled first chunk as a single batch and unsuppress.
    pub fn finish_initial(&mut self) {
        if !self.loading_initial {
            return;
        }
        self.loading_initial = false;
        let target = self.requested_window.min(self.filtered.len());
        let items: Vec<I> = self.filtered[..target]
            .iter()
            .map(|e| e.item.clone())
            .collect();
        self.display_count = target;
        self.subscriber.on_items_added(&items, 0, true);
        self.refresh_availability();
    }

    /// Raise the requested window size. Loaded surplus satisfies it
    /// immediately; the caller checks [`WindowedView::needs_more`] to decide
    /// whether the source must load more.
    pub fn grow_window(&mut self, by: usize) {
        self.requested_window = self.requested_window.saturating_add(by);
        self.dispatch();
    }

    /// Re-enter initial-chunk mode after a source reset.
    pub fn reset(&mut self) {
        self.filtered.clear();
        self.display_count = 0;
        self.loading_initial = true;
        self.available = false;
    }

    fn refresh_availability(&mut self) {
        if self.loading_initial {
            return;
        }
        let now = !self.filtered.is_empty();
        if now != self.available {
            self.available = now;
            self.subscriber.on_availability_changed(now);
        }
    }

    pub fn handle_event(&mut self, event: &ListEvent<I>) {
        match event {
            ListEvent::ItemsAdded { entries, .. } => {
                for entry in entries {
                    if self.matches(&entry.item) {
                        self.binary_insert(entry.clone());
                    }
                }
                self.dispatch();
                self.refresh_availability();
            }
            ListEvent::Added { entry, .. } => {
                if self.matches(&entry.item) {
                    self.apply_add(entry);
                }
            }
            ListEvent::Removed { entry, .. } => {
                if let Some(index) = self.index_of_key(entry.key()) {
                    self.apply_remove(index, entry);
                }
            }
            ListEvent::Moved { entry, .. } => self.apply_move(entry),
            ListEvent::Changed { entry, cause, .. } => {
                let matches = self.matches(&entry.item);
                match (self.index_of_key(entry.key()), matches) {
                    (Some(index), true) => {
                        self.filtered[index] = entry.clone();
                        if index < self.display_count {
                            self.subscriber
                                .on_item_changed(&entry.item, index, *cause);
                        }
                    }
                    // Stopped matching: leaves the view like a removal.
                    (Some(index), false) => self.apply_remove(index, entry),
                    // Started matching: enters the view like a fresh add.
                    (None, true) => self.apply_add(entry),
                    (None, false) => {}
                }
            }
            ListEvent::MetadataChanged => self.subscriber.on_metadata_changed(),
            ListEvent::LoadStateChanged { old, new } => {
                self.subscriber.on_load_state_changed(*old, *new)
            }
            // Collection-level counters; the view derives its own
            // availability from the filtered mirror.
            ListEvent::AvailabilityChanged(_) | ListEvent::TotalCountChanged(_) => {}
        }
    }

    fn apply_add(&mut self, entry: &Entry<I>) {
        let index = self.binary_insert(entry.clone());
        if !self.loading_initial && index < self.display_count {
            self.subscriber.on_item_added(&entry.item, index);
            self.display_count += 1;
        } else {
            // Already indexed, just outside the window; backfill from any
            // loaded surplus.
            self.dispatch();
        }
        self.refresh_availability();
    }

    fn apply_remove(&mut self, index: usize, entry: &Entry<I>) {
        self.filtered.remove(index);
        if !self.loading_initial && index < self.display_count {
            self.display_count -= 1;
            self.subscriber.on_item_removed(&entry.item, index);
            self.dispatch();
        }
        self.refresh_availability();
    }

    fn apply_move(&mut self, entry: &Entry<I>) {
        let matches = self.matches(&entry.item);
        match (self.index_of_key(entry.key()), matches) {
            (Some(from), true) => {
                self.filtered.remove(from);
                let to = self.binary_insert(entry.clone());
                if self.loading_initial {
                    return;
                }
                let was_in = from < self.display_count;
                let now_in = to < self.display_count;
                match (was_in, now_in) {
                    (true, true) => self.subscriber.on_item_moved(&entry.item, from, to),
                    (true, false) => {
                        self.display_count -= 1;
                        self.subscriber.on_item_removed(&entry.item, from);
                        self.dispatch();
                    }
                    (false, true) => {
                        self.subscriber.on_item_added(&entry.item, to);
                        self.display_count += 1;
                    }
                    (false, false) => {}
                }
            }
            (Some(from), false) => self.apply_remove(from, entry),
            (None, true) => self.apply_add(entry),
            (None, false) => {}
        }
    }
}

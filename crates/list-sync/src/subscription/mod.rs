//! Change notification: the event taxonomy, the listener contract and the
//! ownership-tracked listener registry.
//!
//! Events are delivered synchronously, in emission order, on the collection's
//! confinement context. There is no runtime garbage collection to lean on for
//! listener lifetimes, so the registry hands out explicit subscription ids
//! and unsubscription is the caller's job.

use crate::cache::{Entry, LoadState};
use crate::model::{ChangeCause, ListItem};

mod view;

pub use view::{ViewId, WindowedView};

/// Structural and collection-level events emitted by a store.
///
/// `ItemsAdded` is the batched form of `Added`: page merges and window
/// backfills land as one call so bulk consumers do not thrash.
pub enum ListEvent<I: ListItem> {
    ItemsAdded {
        entries: Vec<Entry<I>>,
        start_index: usize,
        initial_chunk: bool,
    },
    Added {
        entry: Entry<I>,
        index: usize,
    },
    Removed {
        entry: Entry<I>,
        index: usize,
    },
    Moved {
        entry: Entry<I>,
        from: usize,
        to: usize,
    },
    Changed {
        entry: Entry<I>,
        index: usize,
        cause: ChangeCause,
    },
    MetadataChanged,
    AvailabilityChanged(bool),
    TotalCountChanged(Option<usize>),
    LoadStateChanged {
        old: LoadState,
        new: LoadState,
    },
}

/// Observer over a collection's change stream.
///
/// Every method has a default body that funnels into
/// [`ListListener::on_list_changed`], so a consumer that only cares that
/// "something changed" implements a single method.
#[allow(unused_variables)]
pub trait ListListener<I: ListItem>: Send {
    fn on_items_added(&mut self, items: &[I], start_index: usize, initial_chunk: bool) {
        self.on_list_changed();
    }

    fn on_item_added(&mut self, item: &I, index: usize) {
        self.on_list_changed();
    }

    fn on_item_removed(&mut self, item: &I, index: usize) {
        self.on_list_changed();
    }

    fn on_item_moved(&mut self, item: &I, from: usize, to: usize) {
        self.on_list_changed();
    }

    fn on_item_changed(&mut self, item: &I, index: usize, cause: ChangeCause) {
        self.on_list_changed();
    }

    fn on_metadata_changed(&mut self) {
        self.on_list_changed();
    }

    fn on_availability_changed(&mut self, available: bool) {
        self.on_list_changed();
    }

    fn on_total_count_changed(&mut self, total: Option<usize>) {
        self.on_list_changed();
    }

    fn on_load_state_changed(&mut self, old: LoadState, new: LoadState) {
        self.on_list_changed();
    }

    /// Generic fallback; default bodies of the other methods end up here.
    fn on_list_changed(&mut self) {}
}

/// Handle for one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Ordered registry of listeners for one collection. Listeners are invoked
/// in subscription order, on the confinement context.
pub struct ListenerSet<I: ListItem> {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Box<dyn ListListener<I>>)>,
}

impl<I: ListItem> Default for ListenerSet<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ListItem> ListenerSet<I> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            listeners: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: Box<dyn ListListener<I>>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn emit(&mut self, event: &ListEvent<I>) {
        // Batched items are materialized once, not per listener.
        let batched: Option<Vec<I>> = match event {
            ListEvent::ItemsAdded { entries, .. } => {
                Some(entries.iter().map(|e| e.item.clone()).collect())
            }
            _ => None,
        };
        for (_, listener) in &mut self.listeners {
            deliver(listener.as_mut(), event, batched.as_deref());
        }
    }
}

fn deliver<I: ListItem>(
    listener: &mut dyn ListListener<I>,
    event: &ListEvent<I>,
    batched: Option<&[I]>,
) {
    match event {
        ListEvent::ItemsAdded {
            start_index,
            initial_chunk,
            ..
        } => {
            listener.on_items_added(batched.unwrap_or(&[]), *start_index, *initial_chunk);
        }
        ListEvent::Added { entry, index } => listener.on_item_added(&entry.item, *index),
        ListEvent::Removed { entry, index } => listener.on_item_removed(&entry.item, *index),
        ListEvent::Moved { entry, from, to } => listener.on_item_moved(&entry.item, *from, *to),
        ListEvent::Changed {
            entry,
            index,
            cause,
        } => listener.on_item_changed(&entry.item, *index, *cause),
        ListEvent::MetadataChanged => listener.on_metadata_changed(),
        ListEvent::AvailabilityChanged(available) => {
            listener.on_availability_changed(*available)
        }
        ListEvent::TotalCountChanged(total) => listener.on_total_count_changed(*total),
        ListEvent::LoadStateChanged { old, new } => listener.on_load_state_changed(*old, *new),
    }
}

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// An externally owned value cached by the list engine.
///
/// Items are mutable at the remote source. The engine never relies on an
/// item's own ordering fields staying put after it entered the collection;
/// it snapshots them into an [`crate::cache::Entry`] and re-reads them only
/// at explicit reposition points.
pub trait ListItem: Clone + Send + Sync + 'static {
    /// Stable identity, unique within one collection.
    type Key: Copy + Eq + Ord + Hash + Debug + Send + Sync + 'static;
    /// Ordering fields assigned by the remote source.
    type Position: Copy + Ord + Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
    fn position(&self) -> Self::Position;
}

/// Pagination direction. `Forward` continues past the last entry (the tail
/// of the sorted sequence), `Backward` before the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

/// Why an in-place `Changed` notification fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    /// The item's payload changed.
    Content,
    /// Item-level metadata changed; filters may depend on it.
    Metadata,
    /// Ordering fields changed but the resolved index did not.
    Reorder,
}

/// Predicate over items, shared between snapshots and windowed views.
pub type ItemFilter<I> = Arc<dyn Fn(&I) -> bool + Send + Sync>;

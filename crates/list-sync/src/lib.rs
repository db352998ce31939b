//! Client-side cache of a remotely-hosted, totally-ordered collection.
//!
//! The engine keeps a comparator-sorted in-memory list of the loaded slice,
//! paginates toward the ends through a [`PageSource`], applies live push
//! updates, and fans structural change events out to listeners and to
//! windowed, filtered views. One tokio task per collection owns all mutable
//! state; the [`ListManager`] handle is the only way in.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use list_sync::{Direction, ListConfig, ListManager, PageSource, ListItem};
//! # async fn demo<I: ListItem, S: PageSource<I>>(source: Arc<S>) {
//! let manager = ListManager::spawn(source, ListConfig::default());
//! let added = manager.load_more(Direction::Forward, 50).await.unwrap();
//! let items = manager.snapshot(None).await.unwrap();
//! # let _ = (added, items);
//! # }
//! ```

pub mod cache;
pub mod manager;
pub mod model;
pub mod subscription;
pub mod sync;

pub use cache::{Entry, ListStore, LoadState, Reposition, StoreError};
pub use manager::{ListConfig, ListManager, ListStats};
pub use model::{ChangeCause, Direction, ItemFilter, ListItem};
pub use subscription::{
    ListEvent, ListListener, ListenerSet, SubscriptionId, ViewId, WindowedView,
};
pub use sync::{
    CountStrategy, Cursor, EmptyOutcome, Epoch, FetchError, FetchScope, PageBatch, PageRequest,
    PageSource, Pager, SourceUpdate, SyncError,
};

//! The confinement context around one collection.
//!
//! All mutable state (store, pager, views, listeners) is owned by a single
//! consumer task; the cloneable [`ListManager`] handle re-posts every call
//! as a message and returns immediately. Mutators are fire-and-forget,
//! reads come back over a oneshot channel, so no method ever assumes
//! synchronous completion.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::cache::LoadState;
use crate::model::{Direction, ItemFilter, ListItem};
use crate::subscription::{ListListener, SubscriptionId, ViewId};
use crate::sync::{PageSource, SyncError};

mod actor;

use actor::{Command, ListActor};

#[derive(Debug, Clone)]
pub struct ListConfig {
    /// Page size for the very first fetch of a lifetime.
    pub initial_load_count: usize,
    /// Page size for every later fetch the engine issues on its own.
    pub load_count: usize,
    /// Whether the collection is anchored mid-sequence and paginates in
    /// both directions.
    pub bidirectional: bool,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            initial_load_count: 20,
            load_count: 50,
            bidirectional: false,
        }
    }
}

/// Point-in-time pagination state, computed on the confinement context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListStats {
    pub loaded: usize,
    pub total_count: Option<usize>,
    pub state: LoadState,
    pub forward_end_reached: bool,
    pub backward_end_reached: bool,
}

/// Cloneable handle to one synchronized collection.
pub struct ListManager<I: ListItem> {
    commands: mpsc::UnboundedSender<Command<I>>,
}

impl<I: ListItem> Clone for ListManager<I> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<I: ListItem> ListManager<I> {
    /// Spawn the collection task. The source's push channel is subscribed
    /// exactly once, before any fetch is issued.
    pub fn spawn<S: PageSource<I>>(source: Arc<S>, config: ListConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let updates = source.subscribe();
        tokio::spawn(ListActor::new(source, config, command_rx, updates).run());
        Self { commands }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command<I>,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| SyncError::Closed)?;
        response.await.map_err(|_| SyncError::Closed)
    }

    /// Fetch one more page in `direction`. Resolves with the number of new
    /// entries; resolves immediately with zero when that end is exhausted.
    /// Concurrent callers while a fetch is in flight coalesce onto it.
    pub async fn load_more(
        &self,
        direction: Direction,
        limit: usize,
    ) -> Result<usize, SyncError> {
        self.request(|reply| Command::LoadMore {
            direction,
            limit,
            reply,
        })
        .await?
    }

    /// Keep fetching forward until at least `min_count` entries are loaded
    /// (aiming for `desired_count`) or the end is reached.
    pub async fn load_at_least(
        &self,
        min_count: usize,
        desired_count: usize,
    ) -> Result<usize, SyncError> {
        self.request(|reply| Command::LoadAtLeast {
            min_count,
            desired_count: desired_count.max(min_count),
            reply,
        })
        .await?
    }

    /// Keep fetching forward in `chunk`-sized pages until fully loaded.
    pub async fn load_all(&self, chunk: usize) -> Result<usize, SyncError> {
        self.request(|reply| Command::LoadAll { chunk, reply }).await?
    }

    /// Thread-safe point-in-time copy, computed on the confinement context.
    pub async fn snapshot(&self, filter: Option<ItemFilter<I>>) -> Result<Vec<I>, SyncError> {
        self.request(|reply| Command::Snapshot { filter, reply }).await
    }

    pub async fn stats(&self) -> Result<ListStats, SyncError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn subscribe(
        &self,
        listener: Box<dyn ListListener<I>>,
    ) -> Result<SubscriptionId, SyncError> {
        self.request(|reply| Command::Subscribe { listener, reply }).await
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.commands.send(Command::Unsubscribe { id });
    }

    /// Attach a windowed, optionally filtered view. Already-loaded matches
    /// replay as one initial batch once the first `initial_window` matches
    /// (or the end of data) have been assembled.
    pub async fn attach_view(
        &self,
        filter: Option<ItemFilter<I>>,
        subscriber: Box<dyn ListListener<I>>,
        initial_window: usize,
    ) -> Result<ViewId, SyncError> {
        self.request(|reply| Command::AttachView {
            filter,
            subscriber,
            initial_window,
            reply,
        })
        .await
    }

    pub fn detach_view(&self, id: ViewId) {
        let _ = self.commands.send(Command::DetachView { id });
    }

    /// Raise a view's requested window size; loaded surplus satisfies it
    /// without a fetch.
    pub fn grow_window(&self, id: ViewId, by: usize) {
        let _ = self.commands.send(Command::GrowWindow { id, by });
    }

    /// Full restart: clears the collection, bumps the epoch so in-flight
    /// responses are discarded, and fails pending load continuations with
    /// [`SyncError::Cancelled`].
    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset);
    }

    /// Tear the collection down. Absorbing; pending continuations are failed
    /// with [`SyncError::Cancelled`] before the task stops.
    pub fn destroy(&self) {
        let _ = self.commands.send(Command::Destroy);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{ListConfig, ListStats};
use crate::cache::{ListStore, LoadState, StoreError};
use crate::model::{ChangeCause, Direction, ItemFilter, ListItem};
use crate::subscription::{ListListener, ListenerSet, SubscriptionId, ViewId, WindowedView};
use crate::sync::{
    CountStrategy, EmptyOutcome, Epoch, FetchError, FetchScope, PageBatch, PageSource, Pager,
    SourceUpdate, SyncError,
};

type LoadReply = oneshot::Sender<Result<usize, SyncError>>;

pub(super) enum Command<I: ListItem> {
    LoadMore {
        direction: Direction,
        limit: usize,
        reply: LoadReply,
    },
    LoadAtLeast {
        min_count: usize,
        desired_count: usize,
        reply: LoadReply,
    },
    LoadAll {
        chunk: usize,
        reply: LoadReply,
    },
    Snapshot {
        filter: Option<ItemFilter<I>>,
        reply: oneshot::Sender<Vec<I>>,
    },
    Stats {
        reply: oneshot::Sender<ListStats>,
    },
    Subscribe {
        listener: Box<dyn ListListener<I>>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    AttachView {
        filter: Option<ItemFilter<I>>,
        subscriber: Box<dyn ListListener<I>>,
        initial_window: usize,
        reply: oneshot::Sender<ViewId>,
    },
    DetachView {
        id: ViewId,
    },
    GrowWindow {
        id: ViewId,
        by: usize,
    },
    Reset,
    Destroy,
}

/// Completions re-posted by fetch tasks, tagged with the epoch they were
/// issued under so anything from a previous lifetime is dropped unseen.
enum Internal<I: ListItem> {
    PageResolved {
        epoch: Epoch,
        direction: Direction,
        scope: FetchScope,
        limit: usize,
        result: Result<PageBatch<I>, FetchError>,
    },
    CountResolved {
        epoch: Epoch,
        strategy: CountStrategy,
        result: Result<usize, FetchError>,
    },
}

/// The single outstanding page fetch. Callers arriving while it is pending
/// park their continuations here instead of issuing another request.
struct InFlight {
    direction: Direction,
    waiters: Vec<LoadReply>,
}

/// A load request that could not ride the current fetch: a deferred single
/// page, or a multi-page campaign that keeps issuing until its target (or
/// the end) is reached.
enum LoadGoal {
    Page {
        direction: Direction,
        limit: usize,
        reply: LoadReply,
    },
    AtLeast {
        min_count: usize,
        desired_count: usize,
        added: usize,
        reply: LoadReply,
    },
    All {
        chunk: usize,
        added: usize,
        reply: LoadReply,
    },
}

enum Wake<I: ListItem> {
    Command(Command<I>),
    Internal(Internal<I>),
    Update(SourceUpdate<I>),
}

pub(super) struct ListActor<I: ListItem, S: PageSource<I>> {
    source: Arc<S>,
    config: ListConfig,
    store: ListStore<I>,
    pager: Pager,
    listeners: ListenerSet<I>,
    views: HashMap<ViewId, WindowedView<I>>,
    next_view_id: u64,
    epoch: Epoch,
    in_flight: Option<InFlight>,
    goals: Vec<LoadGoal>,
    /// Set when a page fetch fails; holds view-driven fetches until the next
    /// external nudge so a broken source gets one attempt per request, not a
    /// retry loop.
    view_fetch_failed: bool,
    commands: mpsc::UnboundedReceiver<Command<I>>,
    internal_tx: mpsc::UnboundedSender<Internal<I>>,
    internal_rx: mpsc::UnboundedReceiver<Internal<I>>,
    source_updates: mpsc::UnboundedReceiver<SourceUpdate<I>>,
    shutdown: bool,
}

impl<I: ListItem, S: PageSource<I>> ListActor<I, S> {
    pub(super) fn new(
        source: Arc<S>,
        config: ListConfig,
        commands: mpsc::UnboundedReceiver<Command<I>>,
        source_updates: mpsc::UnboundedReceiver<SourceUpdate<I>>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let store = ListStore::new(config.bidirectional);
        Self {
            source,
            config,
            store,
            pager: Pager::new(),
            listeners: ListenerSet::new(),
            views: HashMap::new(),
            next_view_id: 0,
            epoch: 0,
            in_flight: None,
            goals: Vec::new(),
            view_fetch_failed: false,
            commands,
            internal_tx,
            internal_rx,
            source_updates,
            shutdown: false,
        }
    }

    pub(super) async fn run(mut self) {
        self.spawn_count(CountStrategy::Cached);
        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    // Every handle dropped; nothing can reach us anymore.
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => Wake::Internal(internal),
                Some(update) = self.source_updates.recv() => Wake::Update(update),
            };
            match wake {
                Wake::Command(command) => self.handle_command(command),
                Wake::Internal(internal) => self.handle_internal(internal),
                Wake::Update(update) => self.handle_update(update),
            }
            self.flush_events();
            self.pump_views();
            self.pump_loads();
            self.flush_events();
            if self.shutdown {
                break;
            }
        }
        debug!(target: "list_sync", "collection task stopped");
    }

    fn handle_command(&mut self, command: Command<I>) {
        match command {
            Command::LoadMore {
                direction,
                limit,
                reply,
            } => self.load_more(direction, limit, reply),
            Command::LoadAtLeast {
                min_count,
                desired_count,
                reply,
            } => {
                if self.store.state() == LoadState::Destroyed {
                    let _ = reply.send(Err(SyncError::Cancelled));
                    return;
                }
                self.view_fetch_failed = false;
                self.goals.push(LoadGoal::AtLeast {
                    min_count,
                    desired_count,
                    added: 0,
                    reply,
                });
            }
            Command::LoadAll { chunk, reply } => {
                if self.store.state() == LoadState::Destroyed {
                    let _ = reply.send(Err(SyncError::Cancelled));
                    return;
                }
                self.view_fetch_failed = false;
                self.goals.push(LoadGoal::All {
                    chunk,
                    added: 0,
                    reply,
                });
            }
            Command::Snapshot { filter, reply } => {
                let _ = reply.send(self.store.snapshot(filter.as_ref()));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Subscribe { listener, reply } => {
                let _ = reply.send(self.listeners.subscribe(listener));
            }
            Command::Unsubscribe { id } => {
                self.listeners.unsubscribe(id);
            }
            Command::AttachView {
                filter,
                subscriber,
                initial_window,
                reply,
            } => {
                let id = ViewId(self.next_view_id);
                self.next_view_id += 1;
                self.view_fetch_failed = false;
                let mut view = WindowedView::new(filter, subscriber, initial_window);
                view.seed(&self.store);
                self.views.insert(id, view);
                let _ = reply.send(id);
            }
            Command::DetachView { id } => {
                self.views.remove(&id);
            }
            Command::GrowWindow { id, by } => {
                if let Some(view) = self.views.get_mut(&id) {
                    view.grow_window(by);
                    self.view_fetch_failed = false;
                }
            }
            Command::Reset => self.reset(),
            Command::Destroy => self.destroy(),
        }
    }

    fn load_more(&mut self, direction: Direction, limit: usize, reply: LoadReply) {
        if self.store.state() == LoadState::Destroyed {
            let _ = reply.send(Err(SyncError::Cancelled));
            return;
        }
        if self.store.is_exhausted(direction) {
            let _ = reply.send(Ok(0));
            return;
        }
        self.view_fetch_failed = false;
        let pending = self.in_flight.as_ref().map(|flight| flight.direction);
        match pending {
            Some(current) if current == direction => {
                if let Some(flight) = self.in_flight.as_mut() {
                    flight.waiters.push(reply);
                }
            }
            Some(_) => self.goals.push(LoadGoal::Page {
                direction,
                limit,
                reply,
            }),
            None => self.issue_fetch(direction, limit, vec![reply]),
        }
    }

    fn handle_internal(&mut self, internal: Internal<I>) {
        match internal {
            Internal::PageResolved {
                epoch,
                direction,
                scope,
                limit,
                result,
            } => {
                if epoch != self.epoch {
                    debug!(
                        target: "list_sync",
                        stale = epoch,
                        current = self.epoch,
                        "dropping page response from a previous lifetime"
                    );
                    return;
                }
                let Some(flight) = self.in_flight.take() else {
                    warn!(target: "list_sync", "page response without an in-flight request");
                    return;
                };
                if result.is_ok() {
                    self.view_fetch_failed = false;
                }
                match result {
                    Err(error) => {
                        warn!(target: "list_sync", %error, ?direction, "page fetch failed");
                        for waiter in flight.waiters {
                            let _ = waiter.send(Err(SyncError::Fetch(error.clone())));
                        }
                        self.fail_campaigns(error);
                        self.view_fetch_failed = true;
                    }
                    Ok(batch) if batch.items.is_empty() => {
                        match self.pager.on_empty(direction, scope, batch.exhausted) {
                            EmptyOutcome::RetryRemote => {
                                // Same continuations ride the escalated request.
                                self.issue_fetch(direction, limit, flight.waiters);
                            }
                            EmptyOutcome::EndReached => {
                                self.store.note_chunk_loaded();
                                self.store.mark_end_reached(direction);
                                if let Some(total) = batch.total_count {
                                    self.store.set_total_count(Some(total));
                                }
                                for waiter in flight.waiters {
                                    let _ = waiter.send(Ok(0));
                                }
                            }
                        }
                    }
                    Ok(batch) => {
                        let initial_chunk = self.store.is_empty();
                        let exhausted = batch.exhausted;
                        let total = batch.total_count;
                        let added = self.store.insert_batch(batch.items, initial_chunk);
                        self.store.note_chunk_loaded();
                        if self.pager.on_batch(direction, scope, exhausted) {
                            self.store.mark_end_reached(direction);
                        }
                        if let Some(total) = total {
                            self.store.set_total_count(Some(total));
                        }
                        debug!(target: "list_sync", added, ?direction, ?scope, "page merged");
                        for waiter in flight.waiters {
                            let _ = waiter.send(Ok(added));
                        }
                        if direction == Direction::Forward {
                            self.credit_campaigns(added);
                        }
                    }
                }
            }
            Internal::CountResolved {
                epoch,
                strategy,
                result,
            } => {
                if epoch != self.epoch {
                    return;
                }
                match result {
                    Ok(total) => {
                        // A merged page may already have brought an
                        // authoritative figure; do not regress it.
                        if self.store.total_count().is_none() {
                            self.store.set_total_count(Some(total));
                        }
                    }
                    Err(error) => match strategy {
                        CountStrategy::Cached => {
                            debug!(
                                target: "list_sync",
                                %error,
                                "cached total count missing; asking the authoritative tier"
                            );
                            self.spawn_count(CountStrategy::Authoritative);
                        }
                        CountStrategy::Authoritative => {
                            warn!(
                                target: "list_sync",
                                %error,
                                "total count unavailable; continuing without one"
                            );
                        }
                    },
                }
            }
        }
    }

    /// Live push from the source. Malformed updates (unknown key, duplicate
    /// add) are logged and skipped; they must not poison the collection.
    fn handle_update(&mut self, update: SourceUpdate<I>) {
        if self.store.state() == LoadState::Destroyed {
            return;
        }
        match update {
            SourceUpdate::Added(item) => match self.store.insert_within_loaded(item) {
                Ok(Some(_)) | Ok(None) => self.store.change_total_count(1),
                Err(StoreError::DuplicateKey) => {
                    debug!(target: "list_sync", "push add for a key already loaded; ignoring");
                }
                Err(error) => {
                    warn!(target: "list_sync", %error, "push add rejected");
                }
            },
            SourceUpdate::Removed(key) => match self.store.remove(key) {
                Ok(_) => self.store.change_total_count(-1),
                Err(StoreError::NotFound) => {
                    // Outside the loaded range; only the total shrinks.
                    self.store.change_total_count(-1);
                }
                Err(error) => {
                    warn!(target: "list_sync", %error, "push remove rejected");
                }
            },
            SourceUpdate::Repositioned { key, position } => {
                if let Err(error) = self.store.reposition(key, position, ChangeCause::Reorder) {
                    debug!(target: "list_sync", %error, "reposition for an unloaded key; ignoring");
                }
            }
            SourceUpdate::Updated { item, cause } => {
                let key = item.key();
                let old_position = match self.store.position_of(key) {
                    Some(position) => position,
                    None => {
                        debug!(target: "list_sync", "update for an unloaded key; ignoring");
                        return;
                    }
                };
                let new_position = item.position();
                if self.store.replace_item(key, item).is_err() {
                    return;
                }
                let outcome = if old_position == new_position {
                    self.store.touch(key, cause).map(|_| ())
                } else {
                    self.store.reposition(key, new_position, cause).map(|_| ())
                };
                if let Err(error) = outcome {
                    warn!(target: "list_sync", %error, "update notification lost");
                }
            }
            SourceUpdate::MetadataChanged => self.store.notify_metadata_changed(),
        }
    }

    /// Drain the store's event buffer into listeners and views, in emission
    /// order.
    fn flush_events(&mut self) {
        let events = self.store.drain_events();
        for event in &events {
            self.listeners.emit(event);
            for view in self.views.values_mut() {
                view.handle_event(event);
            }
        }
    }

    /// Release initial batches that became complete and fetch on behalf of
    /// views whose windows are still short of matches. A failed fetch stalls
    /// the filling until something external asks again.
    fn pump_views(&mut self) {
        if self.views.is_empty()
            || self.shutdown
            || self.store.state() == LoadState::Destroyed
        {
            return;
        }
        let fill_stalled =
            self.store.is_exhausted(Direction::Forward) || self.view_fetch_failed;
        for view in self.views.values_mut() {
            if view.loading_initial() && (!view.needs_more() || fill_stalled) {
                view.finish_initial();
            }
        }
        let demand = !fill_stalled && self.views.values().any(|view| view.needs_more());
        if demand && self.in_flight.is_none() {
            let limit = if self.store.state() == LoadState::Initializing {
                self.config.initial_load_count
            } else {
                self.config.load_count
            };
            self.issue_fetch(Direction::Forward, limit, Vec::new());
        }
    }

    /// Resolve goals the store now satisfies, then issue at most one fetch
    /// for the rest.
    fn pump_loads(&mut self) {
        self.settle_goals();
        if self.store.state() == LoadState::Destroyed || self.shutdown {
            return;
        }
        if self.in_flight.is_some() {
            return;
        }
        if let Some(index) = self
            .goals
            .iter()
            .position(|goal| matches!(goal, LoadGoal::Page { .. }))
        {
            if let LoadGoal::Page {
                direction,
                limit,
                reply,
            } = self.goals.remove(index)
            {
                self.issue_fetch(direction, limit, vec![reply]);
            }
            return;
        }
        let loaded = self.store.len();
        let next_limit = self.goals.iter().find_map(|goal| match goal {
            LoadGoal::AtLeast { desired_count, .. } => {
                Some(desired_count.saturating_sub(loaded).max(1))
            }
            LoadGoal::All { chunk, .. } => Some((*chunk).max(1)),
            LoadGoal::Page { .. } => None,
        });
        if let Some(limit) = next_limit {
            self.issue_fetch(Direction::Forward, limit, Vec::new());
        }
    }

    fn settle_goals(&mut self) {
        let loaded = self.store.len();
        let forward_exhausted = self.store.is_exhausted(Direction::Forward);
        let mut index = 0;
        while index < self.goals.len() {
            let done = match &self.goals[index] {
                LoadGoal::Page { direction, .. } => self.store.is_exhausted(*direction),
                LoadGoal::AtLeast { min_count, .. } => loaded >= *min_count || forward_exhausted,
                LoadGoal::All { .. } => forward_exhausted,
            };
            if !done {
                index += 1;
                continue;
            }
            match self.goals.remove(index) {
                LoadGoal::Page { reply, .. } => {
                    let _ = reply.send(Ok(0));
                }
                LoadGoal::AtLeast { added, reply, .. } | LoadGoal::All { added, reply, .. } => {
                    let _ = reply.send(Ok(added));
                }
            }
        }
    }

    /// Multi-page campaigns absorb fetch failures; deferred single pages
    /// stay queued and take their own turn (and their own error, if it
    /// persists).
    fn fail_campaigns(&mut self, error: FetchError) {
        let mut index = 0;
        while index < self.goals.len() {
            if matches!(self.goals[index], LoadGoal::Page { .. }) {
                index += 1;
                continue;
            }
            match self.goals.remove(index) {
                LoadGoal::AtLeast { reply, .. } | LoadGoal::All { reply, .. } => {
                    let _ = reply.send(Err(SyncError::Fetch(error.clone())));
                }
                LoadGoal::Page { .. } => unreachable!("filtered above"),
            }
        }
    }

    fn credit_campaigns(&mut self, added: usize) {
        for goal in &mut self.goals {
            match goal {
                LoadGoal::AtLeast { added: total, .. } | LoadGoal::All { added: total, .. } => {
                    *total += added;
                }
                LoadGoal::Page { .. } => {}
            }
        }
    }

    fn issue_fetch(&mut self, direction: Direction, limit: usize, waiters: Vec<LoadReply>) {
        let request = self.pager.request(&self.store, direction, limit);
        let scope = request.scope;
        debug!(target: "list_sync", ?direction, limit, ?scope, "issuing page fetch");
        self.in_flight = Some(InFlight { direction, waiters });
        let source = Arc::clone(&self.source);
        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = source.fetch_page(request).await;
            let _ = internal.send(Internal::PageResolved {
                epoch,
                direction,
                scope,
                limit,
                result,
            });
        });
    }

    fn spawn_count(&self, strategy: CountStrategy) {
        let source = Arc::clone(&self.source);
        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = source.fetch_total_count(strategy).await;
            let _ = internal.send(Internal::CountResolved {
                epoch,
                strategy,
                result,
            });
        });
    }

    fn cancel_pending(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            for waiter in flight.waiters {
                let _ = waiter.send(Err(SyncError::Cancelled));
            }
        }
        for goal in self.goals.drain(..) {
            match goal {
                LoadGoal::Page { reply, .. }
                | LoadGoal::AtLeast { reply, .. }
                | LoadGoal::All { reply, .. } => {
                    let _ = reply.send(Err(SyncError::Cancelled));
                }
            }
        }
    }

    fn reset(&mut self) {
        debug!(target: "list_sync", "resetting collection");
        self.epoch += 1;
        self.cancel_pending();
        self.view_fetch_failed = false;
        self.pager.reset();
        self.store.reset();
        for view in self.views.values_mut() {
            view.reset();
        }
        if self.store.state() != LoadState::Destroyed {
            self.spawn_count(CountStrategy::Cached);
        }
    }

    fn destroy(&mut self) {
        debug!(target: "list_sync", "destroying collection");
        self.epoch += 1;
        self.cancel_pending();
        self.store.destroy();
        self.shutdown = true;
    }

    fn stats(&self) -> ListStats {
        ListStats {
            loaded: self.store.len(),
            total_count: self.store.total_count(),
            state: self.store.state(),
            forward_end_reached: self.store.end_reached(Direction::Forward),
            backward_end_reached: self.store.end_reached(Direction::Backward),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::manager::ListManager;
    use crate::sync::PageRequest;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestItem {
        id: u64,
        order: u64,
        starred: bool,
    }

    impl ListItem for TestItem {
        type Key = u64;
        type Position = u64;

        fn key(&self) -> u64 {
            self.id
        }

        fn position(&self) -> u64 {
            self.order
        }
    }

    fn item(id: u64, order: u64) -> TestItem {
        TestItem {
            id,
            order,
            starred: false,
        }
    }

    fn starred(id: u64, order: u64) -> TestItem {
        TestItem {
            id,
            order,
            starred: true,
        }
    }

    fn page(items: Vec<TestItem>, exhausted: bool, total: Option<usize>) -> PageBatch<TestItem> {
        PageBatch {
            items,
            exhausted,
            total_count: total,
        }
    }

    struct MockSource {
        pages: Mutex<VecDeque<Result<PageBatch<TestItem>, FetchError>>>,
        counts: Mutex<VecDeque<Result<usize, FetchError>>>,
        requests: Mutex<Vec<(Direction, FetchScope, Option<u64>)>>,
        count_calls: Mutex<Vec<CountStrategy>>,
        gate: Option<Semaphore>,
        update_rx: Mutex<Option<mpsc::UnboundedReceiver<SourceUpdate<TestItem>>>>,
    }

    impl MockSource {
        fn build(
            pages: Vec<Result<PageBatch<TestItem>, FetchError>>,
            counts: Vec<Result<usize, FetchError>>,
            gated: bool,
        ) -> (Arc<Self>, mpsc::UnboundedSender<SourceUpdate<TestItem>>) {
            let (update_tx, update_rx) = mpsc::unbounded_channel();
            let source = Arc::new(Self {
                pages: Mutex::new(pages.into()),
                counts: Mutex::new(counts.into()),
                requests: Mutex::new(Vec::new()),
                count_calls: Mutex::new(Vec::new()),
                gate: gated.then(|| Semaphore::new(0)),
                update_rx: Mutex::new(Some(update_rx)),
            });
            (source, update_tx)
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn pages_remaining(&self) -> usize {
            self.pages.lock().unwrap().len()
        }

        fn requests(&self) -> Vec<(Direction, FetchScope, Option<u64>)> {
            self.requests.lock().unwrap().clone()
        }

        fn release(&self, permits: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(permits);
            }
        }
    }

    #[async_trait]
    impl PageSource<TestItem> for MockSource {
        async fn fetch_page(
            &self,
            request: PageRequest<TestItem>,
        ) -> Result<PageBatch<TestItem>, FetchError> {
            self.requests.lock().unwrap().push((
                request.direction,
                request.scope,
                request.cursor.map(|cursor| cursor.key),
            ));
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(page(vec![], true, None)))
        }

        async fn fetch_total_count(&self, strategy: CountStrategy) -> Result<usize, FetchError> {
            self.count_calls.lock().unwrap().push(strategy);
            self.counts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::CountUnavailable))
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<SourceUpdate<TestItem>> {
            self.update_rx
                .lock()
                .unwrap()
                .take()
                .expect("subscribe called once")
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Batch(Vec<u64>, usize, bool),
        Added(u64, usize),
        Removed(u64, usize),
        Moved(u64, usize, usize),
        Changed(u64, usize),
        State(LoadState, LoadState),
        Total(Option<usize>),
        Availability(bool),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ListListener<TestItem> for Recorder {
        fn on_items_added(&mut self, items: &[TestItem], start_index: usize, initial_chunk: bool) {
            let keys = items.iter().map(|i| i.id).collect();
            self.seen
                .lock()
                .unwrap()
                .push(Seen::Batch(keys, start_index, initial_chunk));
        }

        fn on_item_added(&mut self, item: &TestItem, index: usize) {
            self.seen.lock().unwrap().push(Seen::Added(item.id, index));
        }

        fn on_item_removed(&mut self, item: &TestItem, index: usize) {
            self.seen.lock().unwrap().push(Seen::Removed(item.id, index));
        }

        fn on_item_moved(&mut self, item: &TestItem, from: usize, to: usize) {
            self.seen.lock().unwrap().push(Seen::Moved(item.id, from, to));
        }

        fn on_item_changed(&mut self, item: &TestItem, index: usize, _cause: ChangeCause) {
            self.seen.lock().unwrap().push(Seen::Changed(item.id, index));
        }

        fn on_load_state_changed(&mut self, old: LoadState, new: LoadState) {
            self.seen.lock().unwrap().push(Seen::State(old, new));
        }

        fn on_total_count_changed(&mut self, total: Option<usize>) {
            self.seen.lock().unwrap().push(Seen::Total(total));
        }

        fn on_availability_changed(&mut self, available: bool) {
            self.seen.lock().unwrap().push(Seen::Availability(available));
        }
    }

    async fn wait_for_stats(
        manager: &ListManager<TestItem>,
        predicate: impl Fn(&ListStats) -> bool,
    ) -> ListStats {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(stats) = manager.stats().await {
                if predicate(&stats) {
                    return stats;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_until(predicate: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !predicate() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn loads_a_page_and_reports_counts() {
        let (source, _updates) = MockSource::build(
            vec![Ok(page(
                vec![item(1, 30), item(2, 20), item(3, 10)],
                false,
                Some(10),
            ))],
            vec![Ok(10)],
            false,
        );
        let manager = ListManager::spawn(source, ListConfig::default());

        let added = manager.load_more(Direction::Forward, 3).await.unwrap();
        assert_eq!(added, 3);

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.loaded, 3);
        assert_eq!(stats.total_count, Some(10));
        assert_eq!(stats.state, LoadState::PartiallyLoaded);
        assert!(!stats.forward_end_reached);

        let snapshot = manager.snapshot(None).await.unwrap();
        let keys: Vec<u64> = snapshot.iter().map(|i| i.id).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn concurrent_load_more_coalesces_onto_one_fetch() {
        let (source, _updates) = MockSource::build(
            vec![Ok(page(vec![item(1, 30), item(2, 20), item(3, 10)], false, None))],
            vec![],
            true,
        );
        let manager = ListManager::spawn(Arc::clone(&source), ListConfig::default());

        let first_handle = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.load_more(Direction::Forward, 50).await })
        };
        {
            let source = Arc::clone(&source);
            wait_until(move || source.request_count() == 1).await;
        }
        let second_handle = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.load_more(Direction::Forward, 50).await })
        };
        // Let the second call reach the task and park on the fetch.
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.release(1);

        assert_eq!(first_handle.await.unwrap().unwrap(), 3);
        assert_eq!(second_handle.await.unwrap().unwrap(), 3);
        assert_eq!(source.request_count(), 1);
    }

    #[tokio::test]
    async fn empty_local_page_escalates_to_remote_before_declaring_end() {
        let (source, _updates) = MockSource::build(
            vec![Ok(page(vec![], false, None)), Ok(page(vec![], true, Some(0)))],
            vec![],
            false,
        );
        let manager = ListManager::spawn(Arc::clone(&source), ListConfig::default());

        let added = manager.load_more(Direction::Forward, 10).await.unwrap();
        assert_eq!(added, 0);

        let requests = source.requests();
        assert_eq!(
            requests,
            vec![
                (Direction::Forward, FetchScope::LocalCache, None),
                (Direction::Forward, FetchScope::Remote, None),
            ]
        );

        let stats = manager.stats().await.unwrap();
        assert!(stats.forward_end_reached);
        assert_eq!(stats.state, LoadState::FullyLoaded);

        // Exhausted ends resolve immediately without touching the source.
        assert_eq!(manager.load_more(Direction::Forward, 10).await.unwrap(), 0);
        assert_eq!(source.request_count(), 2);
    }

    #[tokio::test]
    async fn reset_discards_the_in_flight_response() {
        let (source, _updates) = MockSource::build(
            vec![Ok(page(vec![item(1, 30), item(2, 20), item(3, 10)], false, None))],
            vec![],
            true,
        );
        let manager = ListManager::spawn(Arc::clone(&source), ListConfig::default());
        let recorder = Recorder::default();
        manager.subscribe(Box::new(recorder.clone())).await.unwrap();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.load_more(Direction::Forward, 10).await })
        };
        {
            let source = Arc::clone(&source);
            wait_until(move || source.request_count() == 1).await;
        }
        manager.reset();
        assert_eq!(pending.await.unwrap(), Err(SyncError::Cancelled));

        // Let the stale fetch consume its scripted page and resolve, then
        // verify the new lifetime never sees it.
        source.release(1);
        {
            let source = Arc::clone(&source);
            wait_until(move || source.pages_remaining() == 0).await;
        }
        source.release(10);
        let added = manager.load_more(Direction::Forward, 10).await.unwrap();
        assert_eq!(added, 0);
        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.loaded, 0);
        assert!(stats.forward_end_reached);
        assert!(
            !recorder
                .events()
                .iter()
                .any(|seen| matches!(seen, Seen::Batch(..) | Seen::Added(..))),
            "no item event may come out of a cancelled lifetime"
        );
    }

    #[tokio::test]
    async fn fetch_failure_leaves_state_untouched_and_is_retryable() {
        let (source, _updates) = MockSource::build(
            vec![
                Err(FetchError::Source("backend unavailable".into())),
                Ok(page(vec![item(1, 20), item(2, 10)], false, None)),
            ],
            vec![],
            false,
        );
        let manager = ListManager::spawn(source, ListConfig::default());

        let error = manager.load_more(Direction::Forward, 10).await.unwrap_err();
        assert!(matches!(error, SyncError::Fetch(FetchError::Source(_))));

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.loaded, 0);
        assert_eq!(stats.state, LoadState::Initializing);

        assert_eq!(manager.load_more(Direction::Forward, 10).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn count_falls_back_to_the_authoritative_tier() {
        let (source, _updates) =
            MockSource::build(vec![], vec![Err(FetchError::CountUnavailable), Ok(7)], false);
        let manager = ListManager::spawn(Arc::clone(&source), ListConfig::default());

        wait_for_stats(&manager, |stats| stats.total_count == Some(7)).await;
        assert_eq!(
            *source.count_calls.lock().unwrap(),
            vec![CountStrategy::Cached, CountStrategy::Authoritative]
        );
    }

    #[tokio::test]
    async fn push_updates_flow_through_the_loaded_range() {
        let (source, updates) = MockSource::build(
            vec![Ok(page(vec![item(1, 50), item(3, 30)], false, Some(2)))],
            vec![],
            false,
        );
        let manager = ListManager::spawn(source, ListConfig::default());
        let recorder = Recorder::default();
        manager.subscribe(Box::new(recorder.clone())).await.unwrap();
        manager.load_more(Direction::Forward, 10).await.unwrap();

        updates.send(SourceUpdate::Added(item(2, 40))).unwrap();
        wait_for_stats(&manager, |stats| stats.loaded == 3).await;
        let keys: Vec<u64> = manager
            .snapshot(None)
            .await
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);

        updates
            .send(SourceUpdate::Repositioned { key: 3, position: 60 })
            .unwrap();
        wait_until({
            let recorder = recorder.clone();
            move || recorder.events().contains(&Seen::Moved(3, 2, 0))
        })
        .await;
        let keys: Vec<u64> = manager
            .snapshot(None)
            .await
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(keys, vec![3, 1, 2]);

        updates.send(SourceUpdate::Removed(1)).unwrap();
        let stats = wait_for_stats(&manager, |stats| stats.loaded == 2).await;
        assert_eq!(stats.total_count, Some(2));
        assert!(recorder.events().contains(&Seen::Added(2, 1)));
        assert!(recorder.events().contains(&Seen::Removed(1, 1)));
    }

    #[tokio::test]
    async fn updated_item_with_same_ordering_reports_changed_in_place() {
        let (source, updates) = MockSource::build(
            vec![Ok(page(vec![item(1, 20), item(2, 10)], false, None))],
            vec![],
            false,
        );
        let manager = ListManager::spawn(source, ListConfig::default());
        let recorder = Recorder::default();
        manager.subscribe(Box::new(recorder.clone())).await.unwrap();
        manager.load_more(Direction::Forward, 10).await.unwrap();

        updates
            .send(SourceUpdate::Updated {
                item: starred(2, 10),
                cause: ChangeCause::Content,
            })
            .unwrap();
        wait_until({
            let recorder = recorder.clone();
            move || recorder.events().contains(&Seen::Changed(2, 1))
        })
        .await;
        assert!(
            !recorder
                .events()
                .iter()
                .any(|seen| matches!(seen, Seen::Moved(2, ..))),
            "same resolved ordering must never report a move"
        );
        let snapshot = manager.snapshot(None).await.unwrap();
        assert!(snapshot[1].starred);
    }

    #[tokio::test]
    async fn attached_view_assembles_one_initial_batch_then_streams() {
        let (source, _updates) = MockSource::build(
            vec![
                Ok(page(
                    vec![starred(1, 60), item(2, 50), starred(3, 40)],
                    false,
                    None,
                )),
                Ok(page(vec![starred(4, 30), item(5, 20)], false, None)),
            ],
            vec![],
            false,
        );
        let manager = ListManager::spawn(Arc::clone(&source), ListConfig::default());
        let recorder = Recorder::default();
        let filter: ItemFilter<TestItem> = Arc::new(|i: &TestItem| i.starred);

        let view = manager
            .attach_view(Some(filter), Box::new(recorder.clone()), 2)
            .await
            .unwrap();

        // The view drives its own fill; the first item delivery is one
        // complete initial batch of matches only.
        wait_until({
            let recorder = recorder.clone();
            move || {
                recorder
                    .events()
                    .iter()
                    .any(|seen| matches!(seen, Seen::Batch(..)))
            }
        })
        .await;
        let first_batch = recorder
            .events()
            .into_iter()
            .find(|seen| matches!(seen, Seen::Batch(..)))
            .unwrap();
        assert_eq!(
            first_batch,
            Seen::Batch(vec![1, 3], 0, true),
            "first item delivery must be the complete initial chunk"
        );
        assert!(
            !recorder
                .events()
                .iter()
                .any(|seen| matches!(seen, Seen::Added(..))),
            "nothing streams item-by-item before the initial chunk"
        );

        manager.grow_window(view, 2);
        wait_until({
            let recorder = recorder.clone();
            move || recorder.events().contains(&Seen::Batch(vec![4], 2, false))
        })
        .await;
    }

    #[tokio::test]
    async fn failing_source_does_not_spin_view_driven_fetches() {
        let (source, _updates) = MockSource::build(
            std::iter::repeat_with(|| Err(FetchError::Source("backend unavailable".into())))
                .take(8)
                .collect(),
            vec![],
            false,
        );
        let manager = ListManager::spawn(Arc::clone(&source), ListConfig::default());
        let recorder = Recorder::default();

        let view = manager
            .attach_view(None, Box::new(recorder.clone()), 5)
            .await
            .unwrap();

        wait_until({
            let source = Arc::clone(&source);
            move || source.request_count() >= 1
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            source.request_count(),
            1,
            "a failed view-driven fetch must not be re-issued without new input"
        );
        // The stuck view still resolves its initial chunk, empty as it is.
        assert!(recorder.events().contains(&Seen::Batch(vec![], 0, true)));

        // Asking again grants exactly one more attempt.
        manager.grow_window(view, 1);
        wait_until({
            let source = Arc::clone(&source);
            move || source.request_count() == 2
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.request_count(), 2);
    }

    #[tokio::test]
    async fn load_at_least_keeps_fetching_until_the_floor_is_met() {
        let (source, _updates) = MockSource::build(
            vec![
                Ok(page(vec![item(1, 50), item(2, 40)], false, None)),
                Ok(page(vec![item(3, 30), item(4, 20)], false, None)),
                Ok(page(vec![item(5, 10)], false, None)),
            ],
            vec![],
            false,
        );
        let manager = ListManager::spawn(Arc::clone(&source), ListConfig::default());

        let added = manager.load_at_least(5, 5).await.unwrap();
        assert_eq!(added, 5);
        assert_eq!(source.request_count(), 3);
        assert_eq!(manager.stats().await.unwrap().loaded, 5);
    }

    #[tokio::test]
    async fn load_all_runs_to_the_end() {
        let (source, _updates) = MockSource::build(
            vec![Ok(page(
                vec![item(1, 30), item(2, 20), item(3, 10)],
                false,
                None,
            ))],
            vec![],
            false,
        );
        let manager = ListManager::spawn(source, ListConfig::default());

        let added = manager.load_all(10).await.unwrap();
        assert_eq!(added, 3);
        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.state, LoadState::FullyLoaded);
        assert!(stats.forward_end_reached);
    }

    #[tokio::test]
    async fn destroy_cancels_pending_loads_and_stops_the_task() {
        let (source, _updates) = MockSource::build(
            vec![Ok(page(vec![item(1, 10)], false, None))],
            vec![],
            true,
        );
        let manager = ListManager::spawn(Arc::clone(&source), ListConfig::default());
        let recorder = Recorder::default();
        manager.subscribe(Box::new(recorder.clone())).await.unwrap();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.load_more(Direction::Forward, 10).await })
        };
        {
            let source = Arc::clone(&source);
            wait_until(move || source.request_count() == 1).await;
        }
        manager.destroy();
        source.release(1);

        assert_eq!(pending.await.unwrap(), Err(SyncError::Cancelled));
        wait_until({
            let recorder = recorder.clone();
            move || {
                recorder
                    .events()
                    .iter()
                    .any(|seen| matches!(seen, Seen::State(_, LoadState::Destroyed)))
            }
        })
        .await;

        // The task is gone; every later call fails fast.
        let error = manager.load_more(Direction::Forward, 1).await.unwrap_err();
        assert!(matches!(error, SyncError::Cancelled | SyncError::Closed));
    }
}

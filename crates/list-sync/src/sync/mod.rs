//! The request/response protocol layer between a store and its remote
//! source: the collaborator abstraction, page/count request types, the push
//! update channel, and the pager that reconciles results.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{ChangeCause, Direction, ListItem};

mod pager;

pub use pager::{EmptyOutcome, Pager};

/// Monotonic counter invalidating in-flight requests after a full restart.
/// Responses carrying a stale epoch are dropped unprocessed.
pub type Epoch = u64;

/// Which tier a page request is allowed to hit. A source typically answers
/// `LocalCache` from its own cheap store and `Remote` from authority;
/// sources without the distinction can ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    LocalCache,
    Remote,
}

/// Boundary entry a page continues from. `None` means "from the start".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor<K, P> {
    pub key: K,
    pub position: P,
}

#[derive(Clone)]
pub struct PageRequest<I: ListItem> {
    pub direction: Direction,
    pub cursor: Option<Cursor<I::Key, I::Position>>,
    pub limit: usize,
    pub scope: FetchScope,
}

#[derive(Clone)]
pub struct PageBatch<I> {
    /// Items strictly past the cursor, in collection order.
    pub items: Vec<I>,
    /// The source has no more data in the requested direction.
    pub exhausted: bool,
    /// Total collection size as the source knows it, when it comes for free.
    pub total_count: Option<usize>,
}

/// Total-count strategies, tried in order: the cheap count-only query first,
/// then the expensive authoritative one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountStrategy {
    Cached,
    Authoritative,
}

/// Live updates pushed by the source, keyed by item identity.
#[derive(Clone)]
pub enum SourceUpdate<I: ListItem> {
    Added(I),
    Removed(I::Key),
    Repositioned {
        key: I::Key,
        position: I::Position,
    },
    Updated {
        item: I,
        cause: ChangeCause,
    },
    /// Collection-level metadata changed (name, sort configuration, ...).
    MetadataChanged,
}

/// Failure reported by the collaborator. Transient: collection state is
/// left untouched and the request is safe to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("remote source error: {0}")]
    Source(String),
    #[error("total count unavailable")]
    CountUnavailable,
}

/// Errors surfaced to callers of the async collection API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The collection was reset or destroyed before the request completed.
    #[error("request cancelled by reset or destroy")]
    Cancelled,
    /// The collection task is gone.
    #[error("collection task stopped")]
    Closed,
}

/// The single collaborator abstraction the engine consumes: paginated
/// fetches, a count-only query, and a push channel for live updates.
///
/// `subscribe` is called once per collection lifetime, before the first
/// fetch is issued.
#[async_trait]
pub trait PageSource<I: ListItem>: Send + Sync + 'static {
    async fn fetch_page(&self, request: PageRequest<I>) -> Result<PageBatch<I>, FetchError>;

    async fn fetch_total_count(&self, strategy: CountStrategy) -> Result<usize, FetchError>;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SourceUpdate<I>>;
}

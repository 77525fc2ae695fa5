//! Canonical thread-root discovery.
//!
//! Every item a caller wants a thread for resolves to exactly one root
//! identity, computed once and memoized for the life of the process.

use crate::net::NetworkService;
use crate::tags::{self, ParentRef};
use crate::types::{CanonicalKey, Coordinate, EventRecord, Timestamp};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Resolutions kept memoized; old entries fall out by LRU pressure only.
const RESOLUTION_CACHE_SIZE: usize = 4096;

/// Something a thread view can be anchored to: a record of ours, or a
/// foreign identifier that only exists outside this system.
#[derive(Clone, Debug)]
pub enum ThreadItem {
    Record(EventRecord),
    External(String),
}

impl ThreadItem {
    pub fn record(record: EventRecord) -> Self {
        ThreadItem::Record(record)
    }

    pub fn external(id: impl Into<String>) -> Self {
        ThreadItem::External(id.into())
    }

    /// Memoization key: the record's canonical key, or the foreign id.
    pub fn memo_key(&self) -> CanonicalKey {
        match self {
            ThreadItem::Record(record) => record.canonical_key(),
            ThreadItem::External(id) => CanonicalKey(id.clone()),
        }
    }
}

/// The canonical root identity of a conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RootInfo {
    /// Rooted at an immutable record.
    Event {
        id: String,
        author: String,
        /// Known when the root record itself was in hand at resolution time.
        created_at: Option<Timestamp>,
    },
    /// Rooted at a replaceable record.
    Address {
        coordinate: Coordinate,
        relay_hint: Option<String>,
    },
    /// Rooted at a foreign identifier.
    External { id: String },
}

impl RootInfo {
    /// Identity under which the thread's descriptor and graph edges live.
    pub fn root_key(&self) -> CanonicalKey {
        match self {
            RootInfo::Event { id, .. } => CanonicalKey(id.clone()),
            RootInfo::Address { coordinate, .. } => coordinate.canonical_key(),
            RootInfo::External { id } => CanonicalKey(id.clone()),
        }
    }

    /// The root author, when the root is a record of this system.
    pub fn author(&self) -> Option<&str> {
        match self {
            RootInfo::Event { author, .. } => Some(author),
            RootInfo::Address { coordinate, .. } => Some(&coordinate.author),
            RootInfo::External { .. } => None,
        }
    }

    /// Replaceable roots have a moving visible timestamp, so pagination
    /// treats them differently from immutable ones.
    pub fn is_replaceable(&self) -> bool {
        matches!(self, RootInfo::Address { .. })
    }
}

type ResolveFuture = Shared<BoxFuture<'static, Option<RootInfo>>>;

/// Resolves items to their canonical thread root.
///
/// Concurrent calls for the same item share one in-flight future; completed
/// resolutions stay in the same cache, so re-resolution only happens after
/// LRU eviction.
pub struct RootResolver<N: NetworkService> {
    network: Arc<N>,
    cache: Mutex<LruCache<CanonicalKey, ResolveFuture>>,
}

impl<N: NetworkService> RootResolver<N> {
    pub fn new(network: Arc<N>) -> Self {
        Self {
            network,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(RESOLUTION_CACHE_SIZE).unwrap(),
            )),
        }
    }

    /// Resolves the canonical root of `item`.
    ///
    /// `None` means the root could not be determined (a referenced ancestor
    /// was unreachable); thread features are simply unavailable for the item.
    pub async fn resolve(&self, item: &ThreadItem) -> Option<RootInfo> {
        let key = item.memo_key();
        let future = {
            let mut cache = self.cache.lock();
            if let Some(existing) = cache.get(&key) {
                existing.clone()
            } else {
                let future = Self::resolve_uncached(Arc::clone(&self.network), item.clone())
                    .boxed()
                    .shared();
                cache.put(key, future.clone());
                future
            }
        };
        future.await
    }

    async fn resolve_uncached(network: Arc<N>, item: ThreadItem) -> Option<RootInfo> {
        let record = match item {
            ThreadItem::External(id) => return Some(RootInfo::External { id }),
            ThreadItem::Record(record) => record,
        };

        match tags::root_reference(&record) {
            // No root reference: the item itself anchors the thread.
            None => Some(item_as_root(&record)),
            Some(ParentRef::Address {
                coordinate,
                relay_hint,
            }) => Some(RootInfo::Address {
                coordinate,
                relay_hint,
            }),
            Some(ParentRef::External { id }) => Some(RootInfo::External { id }),
            Some(ParentRef::Event {
                id,
                author_hint: Some(author),
                ..
            }) => Some(RootInfo::Event {
                id,
                author,
                created_at: None,
            }),
            // The reference names an id but not its author; fetch the
            // ancestor and adopt its identity.
            Some(ParentRef::Event {
                id,
                author_hint: None,
                ..
            }) => match network.fetch_event(&id).await {
                Ok(Some(ancestor)) => Some(RootInfo::Event {
                    id: ancestor.id,
                    author: ancestor.author,
                    created_at: Some(ancestor.created_at),
                }),
                Ok(None) => None,
                Err(e) => {
                    debug!(root = %id, error = %e, "root ancestor fetch failed");
                    None
                }
            },
        }
    }
}

fn item_as_root(record: &EventRecord) -> RootInfo {
    match record.coordinate() {
        Some(coordinate) => RootInfo::Address {
            coordinate,
            relay_hint: None,
        },
        None => RootInfo::Event {
            id: record.id.clone(),
            author: record.author.clone(),
            created_at: Some(record.created_at),
        },
    }
}

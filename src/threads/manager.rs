//! Reference-counted live subscriptions, one per resolved thread root.

use crate::error::Result;
use crate::net::{
    CloseReason, NetworkService, RelayList, TimelineHandle, TimelineOptions, TimelineRequest,
    TimelineSink,
};
use crate::resolver::{RootInfo, RootResolver, ThreadItem};
use crate::store::{Lookup, ReplaceableRecordStore};
use crate::threads::ThreadIndex;
use crate::types::{
    CanonicalKey, EventRecord, Filter, Timestamp, KIND_COMMENT, KIND_NOTE, KIND_RELAY_LIST,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for the subscription engine.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// How long a descriptor lingers at refcount 0 before its timeline is
    /// closed; a re-subscribe inside the window cancels the teardown.
    pub grace: Duration,

    /// Upper bound on relays queried per thread.
    pub max_relays: usize,

    /// Fallback relays appended after the root author's declared read set.
    pub default_relays: Vec<String>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(2000),
            max_relays: 8,
            default_relays: Vec::new(),
        }
    }
}

/// Lifecycle of one descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Subscribe requested, timeline not open yet.
    Pending,
    /// Receiving backlog and live updates.
    Active,
    /// Refcount reached 0, grace timer running.
    Draining,
    /// Torn down; a fresh subscribe recreates the descriptor.
    Closed,
}

struct Descriptor {
    refcount: usize,
    state: SubscriptionState,
    timeline: Option<TimelineHandle>,
    /// Next `until` for backward pagination.
    cursor: Option<Timestamp>,
    /// Oldest `created_at` seen on this timeline so far.
    oldest_seen: Option<Timestamp>,
    /// Pagination floor for non-replaceable roots (replies cannot predate
    /// their root). `None` for replaceable roots, whose visible timestamp
    /// moves with each revision.
    floor: Option<Timestamp>,
    exhausted: bool,
    close_reason: Option<(String, CloseReason)>,
    grace_task: Option<JoinHandle<()>>,
}

/// Counts of live descriptors by state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub pending: usize,
    pub active: usize,
    pub draining: usize,
}

struct Inner<N: NetworkService> {
    network: Arc<N>,
    resolver: Arc<RootResolver<N>>,
    index: Arc<ThreadIndex>,
    /// Relay-list cache consulted before asking the network.
    replaceable: Option<Arc<ReplaceableRecordStore>>,
    config: SubscriptionConfig,
    descriptors: Mutex<HashMap<CanonicalKey, Descriptor>>,
}

/// Controller over one live, paginated network subscription per thread root.
///
/// `subscribe`/`unsubscribe` are reference-counted: the first interest in a
/// root opens the timeline, the last loss of interest schedules a debounced
/// teardown. Ingested records flow into the [`ThreadIndex`] for the life of
/// the subscription.
pub struct SubscriptionManager<N: NetworkService> {
    inner: Arc<Inner<N>>,
}

impl<N: NetworkService> SubscriptionManager<N> {
    pub fn new(
        network: Arc<N>,
        resolver: Arc<RootResolver<N>>,
        index: Arc<ThreadIndex>,
        replaceable: Option<Arc<ReplaceableRecordStore>>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                network,
                resolver,
                index,
                replaceable,
                config,
                descriptors: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers interest in the thread of `item` and ensures one live
    /// timeline exists for its root.
    ///
    /// Returns `false` when the root cannot be resolved (no thread view is
    /// available for the item; not an error).
    pub async fn subscribe(&self, item: &ThreadItem, limit: usize) -> Result<bool> {
        let Some(root) = self.inner.resolver.resolve(item).await else {
            return Ok(false);
        };
        let key = root.root_key();

        {
            let mut descriptors = self.inner.descriptors.lock();
            if let Some(descriptor) = descriptors.get_mut(&key) {
                if descriptor.state != SubscriptionState::Closed {
                    descriptor.refcount += 1;
                    if let Some(task) = descriptor.grace_task.take() {
                        task.abort();
                    }
                    if descriptor.state == SubscriptionState::Draining {
                        descriptor.state = if descriptor.timeline.is_some() {
                            SubscriptionState::Active
                        } else {
                            SubscriptionState::Pending
                        };
                    }
                    return Ok(true);
                }
                descriptors.remove(&key);
            }

            let floor = match &root {
                RootInfo::Event { created_at, .. } => *created_at,
                _ => None,
            };
            descriptors.insert(
                key.clone(),
                Descriptor {
                    refcount: 1,
                    state: SubscriptionState::Pending,
                    timeline: None,
                    cursor: None,
                    oldest_seen: None,
                    floor,
                    exhausted: false,
                    close_reason: None,
                    grace_task: None,
                },
            );
        }

        // Cold start: whatever the durable side-channel already holds for
        // this root becomes visible before the network answers.
        self.inner.index.hydrate(&thread_filters(&root, None));

        let relays = self.inner.relay_set(&root).await;
        let requests: Vec<TimelineRequest> = thread_filters(&root, Some(limit))
            .into_iter()
            .map(|filter| TimelineRequest {
                urls: relays.clone(),
                filter,
            })
            .collect();
        let sink = Arc::new(IngestSink {
            inner: Arc::clone(&self.inner),
            root_key: key.clone(),
        });

        match self
            .inner
            .network
            .subscribe_timeline(requests, sink, TimelineOptions::default())
            .await
        {
            Ok(handle) => {
                let stale = {
                    let mut descriptors = self.inner.descriptors.lock();
                    match descriptors.get_mut(&key) {
                        Some(descriptor) => {
                            descriptor.timeline = Some(handle);
                            if descriptor.state == SubscriptionState::Pending {
                                descriptor.state = SubscriptionState::Active;
                            }
                            None
                        }
                        // Descriptor vanished while the open was in flight.
                        None => Some(handle),
                    }
                };
                if let Some(handle) = stale {
                    let _ = self.inner.network.close_timeline(&handle.key).await;
                }
                Ok(true)
            }
            Err(e) => {
                self.inner.descriptors.lock().remove(&key);
                Err(e)
            }
        }
    }

    /// Releases one reference to the thread of `item`. When the count hits
    /// zero, teardown is scheduled after the grace window rather than
    /// performed immediately.
    pub async fn unsubscribe(&self, item: &ThreadItem) -> Result<bool> {
        let Some(root) = self.inner.resolver.resolve(item).await else {
            return Ok(false);
        };
        let key = root.root_key();

        let mut descriptors = self.inner.descriptors.lock();
        let Some(descriptor) = descriptors.get_mut(&key) else {
            return Ok(false);
        };
        descriptor.refcount = descriptor.refcount.saturating_sub(1);
        if descriptor.refcount == 0 && descriptor.state != SubscriptionState::Closed {
            descriptor.state = SubscriptionState::Draining;
            let inner = Arc::clone(&self.inner);
            let grace = self.inner.config.grace;
            let drain_key = key.clone();
            descriptor.grace_task = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                Inner::finish_teardown(inner, drain_key).await;
            }));
        }
        Ok(true)
    }

    /// Pages the thread backward by one batch.
    ///
    /// Returns `true` while more history may exist, `false` once the backlog
    /// is exhausted (or no live subscription exists for the item).
    pub async fn load_more(&self, item: &ThreadItem, limit: usize) -> Result<bool> {
        let Some(root) = self.inner.resolver.resolve(item).await else {
            return Ok(false);
        };
        let key = root.root_key();

        let (timeline_key, until) = {
            let descriptors = self.inner.descriptors.lock();
            let Some(descriptor) = descriptors.get(&key) else {
                return Ok(false);
            };
            if descriptor.exhausted {
                return Ok(false);
            }
            let Some(handle) = &descriptor.timeline else {
                return Ok(false);
            };
            let until = descriptor.cursor.unwrap_or_else(|| match descriptor.oldest_seen {
                Some(oldest) => Timestamp(oldest.0 - 1),
                None => Timestamp::now(),
            });
            (handle.key.clone(), until)
        };

        let records = self
            .inner
            .network
            .load_more_timeline(&timeline_key, until, limit)
            .await?;
        if records.is_empty() {
            if let Some(descriptor) = self.inner.descriptors.lock().get_mut(&key) {
                descriptor.exhausted = true;
            }
            return Ok(false);
        }

        let oldest = records
            .iter()
            .map(|r| r.created_at)
            .min()
            .unwrap_or(until);
        let batch: Vec<(EventRecord, Vec<String>)> = records
            .into_iter()
            .map(|r| {
                let provenance = self.inner.network.seen_on_relays(&r.id);
                (r, provenance)
            })
            .collect();
        self.inner.index.ingest_with_provenance(batch);

        let mut descriptors = self.inner.descriptors.lock();
        let Some(descriptor) = descriptors.get_mut(&key) else {
            return Ok(false);
        };
        descriptor.oldest_seen = Some(match descriptor.oldest_seen {
            Some(seen) => seen.min(oldest),
            None => oldest,
        });
        let next = Timestamp(oldest.0 - 1);
        if let Some(floor) = descriptor.floor {
            if next < floor {
                descriptor.exhausted = true;
                return Ok(false);
            }
        }
        descriptor.cursor = Some(next);
        Ok(true)
    }

    /// Last transport close recorded for the item's timeline, if any.
    pub async fn close_reason(&self, item: &ThreadItem) -> Option<(String, CloseReason)> {
        let root = self.inner.resolver.resolve(item).await?;
        self.inner
            .descriptors
            .lock()
            .get(&root.root_key())
            .and_then(|d| d.close_reason.clone())
    }

    /// Lifecycle state of the descriptor for `item`, if one exists.
    pub async fn state(&self, item: &ThreadItem) -> Option<SubscriptionState> {
        let root = self.inner.resolver.resolve(item).await?;
        self.inner
            .descriptors
            .lock()
            .get(&root.root_key())
            .map(|d| d.state)
    }

    /// Snapshot of live descriptor counts.
    pub fn stats(&self) -> SubscriptionStats {
        let descriptors = self.inner.descriptors.lock();
        let mut stats = SubscriptionStats::default();
        for descriptor in descriptors.values() {
            match descriptor.state {
                SubscriptionState::Pending => stats.pending += 1,
                SubscriptionState::Active => stats.active += 1,
                SubscriptionState::Draining => stats.draining += 1,
                SubscriptionState::Closed => {}
            }
        }
        stats
    }

    /// Closes every timeline and cancels pending teardowns.
    pub async fn shutdown(&self) {
        let handles: Vec<TimelineHandle> = {
            let mut descriptors = self.inner.descriptors.lock();
            let handles = descriptors
                .values_mut()
                .filter_map(|d| {
                    if let Some(task) = d.grace_task.take() {
                        task.abort();
                    }
                    d.state = SubscriptionState::Closed;
                    d.timeline.take()
                })
                .collect();
            descriptors.clear();
            handles
        };
        for handle in handles {
            if let Err(e) = self.inner.network.close_timeline(&handle.key).await {
                warn!(error = %e, "closing timeline during shutdown failed");
            }
        }
    }
}

impl<N: NetworkService> Inner<N> {
    /// Relay set for a root: the root author's declared read relays, the
    /// address relay hint, then the configured fallbacks; capped.
    async fn relay_set(&self, root: &RootInfo) -> Vec<String> {
        let mut relays: Vec<String> = Vec::new();
        if let RootInfo::Address {
            relay_hint: Some(hint),
            ..
        } = root
        {
            relays.push(hint.clone());
        }
        if let Some(author) = root.author() {
            if let Some(list) = self.author_relay_list(author).await {
                relays.extend(list.read);
            }
        }
        relays.extend(self.config.default_relays.iter().cloned());
        let mut seen = std::collections::HashSet::new();
        relays.retain(|r| seen.insert(r.clone()));
        relays.truncate(self.config.max_relays);
        relays
    }

    /// Declared relay list for an author: cached record first, network
    /// second. A cached tombstone means the lookup already came back empty,
    /// so the network is not asked again.
    async fn author_relay_list(&self, author: &str) -> Option<RelayList> {
        if let Some(store) = &self.replaceable {
            match store.get(author, KIND_RELAY_LIST, None) {
                Ok(Lookup::Found(record)) => return Some(RelayList::from_record(&record)),
                Ok(Lookup::Absent) => return None,
                Ok(Lookup::Unqueried) => {}
                Err(e) => debug!(author, error = %e, "relay-list cache lookup failed"),
            }
        }
        match self.network.fetch_relay_list(author).await {
            Ok(found) => found,
            Err(e) => {
                debug!(author, error = %e, "relay list fetch failed");
                None
            }
        }
    }

    /// Runs after the grace window: if nobody re-subscribed, the descriptor
    /// is closed and removed.
    async fn finish_teardown(inner: Arc<Self>, key: CanonicalKey) {
        let handle = {
            let mut descriptors = inner.descriptors.lock();
            match descriptors.get_mut(&key) {
                Some(descriptor)
                    if descriptor.refcount == 0
                        && descriptor.state == SubscriptionState::Draining =>
                {
                    descriptor.state = SubscriptionState::Closed;
                    let handle = descriptor.timeline.take();
                    descriptors.remove(&key);
                    handle
                }
                _ => None,
            }
        };
        if let Some(handle) = handle {
            if let Err(e) = inner.network.close_timeline(&handle.key).await {
                warn!(error = %e, "closing drained timeline failed");
            }
        }
    }
}

/// Sink handed to the transport; pushes everything a timeline produces into
/// the thread index, with provenance, and records transport closures.
struct IngestSink<N: NetworkService> {
    inner: Arc<Inner<N>>,
    root_key: CanonicalKey,
}

impl<N: NetworkService> IngestSink<N> {
    fn deliver(&self, records: Vec<EventRecord>) {
        if records.is_empty() {
            return;
        }
        if let Some(oldest) = records.iter().map(|r| r.created_at).min() {
            let mut descriptors = self.inner.descriptors.lock();
            if let Some(descriptor) = descriptors.get_mut(&self.root_key) {
                descriptor.oldest_seen = Some(match descriptor.oldest_seen {
                    Some(seen) => seen.min(oldest),
                    None => oldest,
                });
            }
        }
        let batch: Vec<(EventRecord, Vec<String>)> = records
            .into_iter()
            .map(|r| {
                let provenance = self.inner.network.seen_on_relays(&r.id);
                (r, provenance)
            })
            .collect();
        self.inner.index.ingest_with_provenance(batch);
    }
}

impl<N: NetworkService> TimelineSink for IngestSink<N> {
    fn on_events(&self, records: Vec<EventRecord>, _end_of_stored: bool) {
        self.deliver(records);
    }

    fn on_new(&self, record: EventRecord) {
        self.deliver(vec![record]);
    }

    fn on_close(&self, relay: &str, reason: CloseReason) {
        debug!(relay, ?reason, root = %self.root_key, "timeline relay closed");
        let mut descriptors = self.inner.descriptors.lock();
        if let Some(descriptor) = descriptors.get_mut(&self.root_key) {
            descriptor.close_reason = Some((relay.to_string(), reason));
        }
    }
}

/// Filter sets covering both reply conventions for a root.
pub(crate) fn thread_filters(root: &RootInfo, limit: Option<usize>) -> Vec<Filter> {
    let mut filters = match root {
        RootInfo::Event { id, .. } => vec![
            Filter::new().kinds([KIND_NOTE]).tag("e", [id.as_str()]),
            Filter::new().kinds([KIND_COMMENT]).tag("E", [id.as_str()]),
        ],
        RootInfo::Address { coordinate, .. } => {
            let coordinate = coordinate.to_string();
            vec![
                Filter::new()
                    .kinds([KIND_NOTE])
                    .tag("a", [coordinate.as_str()]),
                Filter::new()
                    .kinds([KIND_COMMENT])
                    .tag("A", [coordinate.as_str()]),
            ]
        }
        RootInfo::External { id } => vec![Filter::new()
            .kinds([KIND_COMMENT])
            .tag("I", [id.as_str()])],
    };
    if let Some(limit) = limit {
        for filter in &mut filters {
            filter.limit = Some(limit);
        }
    }
    filters
}

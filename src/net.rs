//! Network boundary consumed by the sync engine.
//!
//! The transport itself (connection lifecycle, retries, relay bookkeeping)
//! lives elsewhere; this module only specifies the contract the engine
//! programs against, plus the callback sink it hands to the transport.

use crate::error::Result;
use crate::types::{EventRecord, Filter, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque identity of one open timeline subscription.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TimelineKey(pub String);

impl fmt::Debug for TimelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimelineKey({})", self.0)
    }
}

/// One relay-scoped request of a timeline subscription.
#[derive(Clone, Debug)]
pub struct TimelineRequest {
    pub urls: Vec<String>,
    pub filter: Filter,
}

/// Options for opening a timeline.
#[derive(Clone, Debug)]
pub struct TimelineOptions {
    /// Keep streaming live records after the stored backlog is delivered.
    pub live: bool,
}

impl Default for TimelineOptions {
    fn default() -> Self {
        Self { live: true }
    }
}

/// Why a relay closed its side of a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Connection dropped.
    Disconnected,
    /// Relay refused or terminated the request.
    Error(String),
    /// Closed locally.
    Shutdown,
}

/// Returned by `subscribe_timeline`; pass the key back to page or close.
#[derive(Clone, Debug)]
pub struct TimelineHandle {
    pub key: TimelineKey,
}

/// A relay set declared by an author.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayList {
    pub read: Vec<String>,
    pub write: Vec<String>,
}

impl RelayList {
    /// Decodes a declared relay-list record: `["r", url, marker?]` tags,
    /// where a missing marker means the relay serves both directions.
    pub fn from_record(record: &EventRecord) -> Self {
        let mut list = RelayList::default();
        for tag in &record.tags {
            if tag.first().map(String::as_str) != Some("r") {
                continue;
            }
            let Some(url) = tag.get(1).filter(|s| !s.is_empty()) else {
                continue;
            };
            match tag.get(2).map(String::as_str) {
                Some("read") => list.read.push(url.clone()),
                Some("write") => list.write.push(url.clone()),
                _ => {
                    list.read.push(url.clone());
                    list.write.push(url.clone());
                }
            }
        }
        list
    }
}

/// Callbacks invoked by the transport as a timeline produces records.
///
/// `on_events` delivers stored-backlog batches (`end_of_stored` marks the
/// last one per relay), `on_new` delivers live records after that. Both may
/// redeliver the same record from different relays.
pub trait TimelineSink: Send + Sync {
    fn on_events(&self, records: Vec<EventRecord>, end_of_stored: bool);
    fn on_new(&self, record: EventRecord);
    fn on_close(&self, relay: &str, reason: CloseReason);
}

/// The subscription service the engine consumes.
#[async_trait]
pub trait NetworkService: Send + Sync + 'static {
    /// Opens one paginated live timeline over a set of relay-scoped requests.
    async fn subscribe_timeline(
        &self,
        requests: Vec<TimelineRequest>,
        sink: Arc<dyn TimelineSink>,
        options: TimelineOptions,
    ) -> Result<TimelineHandle>;

    /// Closes a previously opened timeline.
    async fn close_timeline(&self, key: &TimelineKey) -> Result<()>;

    /// Fetches one page of history older than `until`, newest first.
    async fn load_more_timeline(
        &self,
        key: &TimelineKey,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<EventRecord>>;

    /// Fetches a single record by id from wherever it can be found.
    async fn fetch_event(&self, id: &str) -> Result<Option<EventRecord>>;

    /// Fetches an author's declared relay list.
    async fn fetch_relay_list(&self, author: &str) -> Result<Option<RelayList>>;

    /// Relays a record has already been seen on (provenance).
    fn seen_on_relays(&self, id: &str) -> Vec<String>;

    /// Best single relay guess for locating a record.
    fn source_hint(&self, id: &str) -> Option<String>;
}

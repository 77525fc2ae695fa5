//! Shared fixtures: an in-process mock of the network service and record
//! builders used across the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft::{
    CloseReason, Error, EventRecord, NetworkService, RelayList, Result, TimelineHandle,
    TimelineKey, TimelineOptions, TimelineRequest, TimelineSink, Timestamp, KIND_NOTE,
};

/// Routes engine logs through the test harness when `--nocapture` is on.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct OpenTimeline {
    requests: Vec<TimelineRequest>,
    sink: Arc<dyn TimelineSink>,
}

/// A deterministic stand-in for the relay transport. Holds a fixed backlog,
/// delivers the newest matches on subscribe, pages backward on demand, and
/// can push live records or relay closures into open sinks.
#[derive(Default)]
pub struct MockNetwork {
    pub backlog: Mutex<Vec<EventRecord>>,
    pub fetchable: Mutex<HashMap<String, EventRecord>>,
    pub relay_lists: Mutex<HashMap<String, RelayList>>,
    pub seen_sources: Mutex<HashMap<String, Vec<String>>>,
    pub last_requests: Mutex<Vec<TimelineRequest>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub relay_list_fetches: AtomicUsize,
    pub fail_subscribe: Mutex<bool>,
    timelines: Mutex<HashMap<String, OpenTimeline>>,
    next_key: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_backlog(&self, records: impl IntoIterator<Item = EventRecord>) {
        self.backlog.lock().extend(records);
    }

    pub fn add_fetchable(&self, record: EventRecord) {
        self.fetchable.lock().insert(record.id.clone(), record);
    }

    /// Delivers a record to every open timeline whose filters match.
    pub fn push_live(&self, record: &EventRecord) {
        let timelines = self.timelines.lock();
        for timeline in timelines.values() {
            if timeline
                .requests
                .iter()
                .any(|r| r.filter.matches(record))
            {
                timeline.sink.on_new(record.clone());
            }
        }
    }

    /// Reports a relay-side closure to every open timeline.
    pub fn close_relay(&self, relay: &str, reason: CloseReason) {
        let timelines = self.timelines.lock();
        for timeline in timelines.values() {
            timeline.sink.on_close(relay, reason.clone());
        }
    }

    pub fn open_timeline_count(&self) -> usize {
        self.timelines.lock().len()
    }

    fn matching(&self, requests: &[TimelineRequest], until: Option<Timestamp>) -> Vec<EventRecord> {
        let backlog = self.backlog.lock();
        let mut matches: Vec<EventRecord> = Vec::new();
        for record in backlog.iter() {
            if let Some(until) = until {
                if record.created_at > until {
                    continue;
                }
            }
            if requests.iter().any(|r| r.filter.matches(record))
                && !matches.iter().any(|m| m.id == record.id)
            {
                matches.push(record.clone());
            }
        }
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches
    }
}

#[async_trait]
impl NetworkService for MockNetwork {
    async fn subscribe_timeline(
        &self,
        requests: Vec<TimelineRequest>,
        sink: Arc<dyn TimelineSink>,
        _options: TimelineOptions,
    ) -> Result<TimelineHandle> {
        if *self.fail_subscribe.lock() {
            return Err(Error::Network("mock subscribe failure".into()));
        }
        let key = format!("timeline-{}", self.next_key.fetch_add(1, Ordering::SeqCst));
        *self.last_requests.lock() = requests.clone();

        let limit = requests.iter().find_map(|r| r.filter.limit);
        let mut initial = self.matching(&requests, None);
        if let Some(limit) = limit {
            initial.truncate(limit);
        }
        sink.on_events(initial, true);

        self.timelines
            .lock()
            .insert(key.clone(), OpenTimeline { requests, sink });
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(TimelineHandle {
            key: TimelineKey(key),
        })
    }

    async fn close_timeline(&self, key: &TimelineKey) -> Result<()> {
        self.timelines.lock().remove(&key.0);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_more_timeline(
        &self,
        key: &TimelineKey,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let requests = {
            let timelines = self.timelines.lock();
            let timeline = timelines
                .get(&key.0)
                .ok_or_else(|| Error::SubscriptionClosed(key.0.clone()))?;
            timeline.requests.clone()
        };
        let mut page = self.matching(&requests, Some(until));
        page.truncate(limit);
        Ok(page)
    }

    async fn fetch_event(&self, id: &str) -> Result<Option<EventRecord>> {
        Ok(self.fetchable.lock().get(id).cloned())
    }

    async fn fetch_relay_list(&self, author: &str) -> Result<Option<RelayList>> {
        self.relay_list_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.relay_lists.lock().get(author).cloned())
    }

    fn seen_on_relays(&self, id: &str) -> Vec<String> {
        self.seen_sources
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| vec!["wss://mock.relay".to_string()])
    }

    fn source_hint(&self, _id: &str) -> Option<String> {
        None
    }
}

// --- Record builders ---

/// A root note with no parentage references.
pub fn root_note(id: &str, author: &str, created_at: i64) -> EventRecord {
    EventRecord {
        id: id.into(),
        author: author.into(),
        kind: KIND_NOTE,
        created_at: Timestamp(created_at),
        tags: Vec::new(),
        content: format!("root {id}"),
    }
}

/// A note replying to `parent` inside the thread rooted at `root`, using
/// marked references with inline root-author fidelity.
pub fn reply_note(
    id: &str,
    author: &str,
    root: &str,
    root_author: &str,
    parent: &str,
    created_at: i64,
) -> EventRecord {
    EventRecord {
        id: id.into(),
        author: author.into(),
        kind: KIND_NOTE,
        created_at: Timestamp(created_at),
        tags: vec![
            vec![
                "e".into(),
                root.into(),
                String::new(),
                "root".into(),
                root_author.into(),
            ],
            vec!["e".into(), parent.into(), String::new(), "reply".into()],
        ],
        content: format!("reply {id}"),
    }
}

/// A direct reply to the root itself.
pub fn root_reply(
    id: &str,
    author: &str,
    root: &str,
    root_author: &str,
    created_at: i64,
) -> EventRecord {
    EventRecord {
        id: id.into(),
        author: author.into(),
        kind: KIND_NOTE,
        created_at: Timestamp(created_at),
        tags: vec![vec![
            "e".into(),
            root.into(),
            String::new(),
            "root".into(),
            root_author.into(),
        ]],
        content: format!("reply {id}"),
    }
}

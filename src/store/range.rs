//! Time-indexed append-only store of immutable records.

use super::database::{Database, StoreFile};
use super::SweepHandle;
use crate::error::Result;
use crate::types::{epoch_millis, EventRecord, Filter, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

const SWEEP_INITIAL_DELAY: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Records whose `created_at` is older than this are dropped by the sweep.
const RETENTION_SECS: i64 = 14 * 24 * 60 * 60;

/// One cached record plus the relays it was seen on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    pub record: EventRecord,
    pub provenance: Vec<String>,
    pub added_at: i64,
}

/// On-disk log entry.
#[derive(Debug, Serialize, Deserialize)]
enum RangeEntry {
    Put(StoredEvent),
    Delete(String),
}

/// Durable, time-indexed store of immutable records.
///
/// Upserts are idempotent by record id; redelivery from another relay only
/// merges provenance. Range scans walk a `created_at`-descending index and
/// test each candidate against the filter; eviction walks ascending and
/// stops at the boundary.
pub struct RangeEventStore {
    file: StoreFile,
    events: RwLock<HashMap<String, StoredEvent>>,
    /// Secondary index: `(created_at, id)`, rebuilt on replay.
    time_index: RwLock<BTreeSet<(Timestamp, String)>>,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl RangeEventStore {
    /// Opens the store, replays the log, and starts the retention sweep.
    pub fn open(db: &Database) -> Result<Arc<Self>> {
        let file = db.open_store("events")?;
        let mut events: HashMap<String, StoredEvent> = HashMap::new();
        let mut time_index: BTreeSet<(Timestamp, String)> = BTreeSet::new();
        for entry in file.replay::<RangeEntry>()? {
            match entry {
                RangeEntry::Put(stored) => {
                    let id = stored.record.id.clone();
                    if let Some(previous) = events.insert(id.clone(), stored.clone()) {
                        time_index.remove(&(previous.record.created_at, id.clone()));
                    }
                    time_index.insert((stored.record.created_at, id));
                }
                RangeEntry::Delete(id) => {
                    if let Some(previous) = events.remove(&id) {
                        time_index.remove(&(previous.record.created_at, id));
                    }
                }
            }
        }

        let store = Arc::new(Self {
            file,
            events: RwLock::new(events),
            time_index: RwLock::new(time_index),
            sweeper: Mutex::new(None),
        });
        let weak: Weak<Self> = Arc::downgrade(&store);
        let handle = SweepHandle::spawn(
            "events",
            SWEEP_INITIAL_DELAY,
            SWEEP_INTERVAL,
            move || match weak.upgrade() {
                Some(store) => {
                    match store.sweep() {
                        Ok(removed) if removed > 0 => {
                            debug!(removed, "range-store sweep evicted expired records")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "range-store sweep failed"),
                    }
                    true
                }
                None => false,
            },
        )?;
        *store.sweeper.lock() = Some(handle);
        Ok(store)
    }

    /// Idempotent upsert keyed by record id. Returns how many records were
    /// newly stored; redelivered ids only merge provenance.
    pub fn append(&self, items: &[(EventRecord, Vec<String>)]) -> Result<usize> {
        let mut events = self.events.write();
        let mut time_index = self.time_index.write();
        let mut stored_count = 0;

        for (record, provenance) in items {
            if let Some(existing) = events.get_mut(&record.id) {
                let mut changed = false;
                for relay in provenance {
                    if !existing.provenance.contains(relay) {
                        existing.provenance.push(relay.clone());
                        changed = true;
                    }
                }
                if changed {
                    self.file.append(&RangeEntry::Put(existing.clone()))?;
                }
                continue;
            }

            let stored = StoredEvent {
                record: record.clone(),
                provenance: provenance.clone(),
                added_at: epoch_millis(),
            };
            self.file.append(&RangeEntry::Put(stored.clone()))?;
            time_index.insert((record.created_at, record.id.clone()));
            events.insert(record.id.clone(), stored);
            stored_count += 1;
        }
        Ok(stored_count)
    }

    /// Single-record lookup by id.
    pub fn get(&self, id: &str) -> Option<StoredEvent> {
        self.events.read().get(id).cloned()
    }

    /// Walks the time index newest-first, testing each candidate against
    /// `filter`, stopping once `limit` (argument, or the filter's own) hits.
    pub fn query_range(&self, filter: &Filter, limit: Option<usize>) -> Vec<StoredEvent> {
        let cap = limit.or(filter.limit);
        let events = self.events.read();
        let time_index = self.time_index.read();

        let mut matches = Vec::new();
        for (_, id) in time_index.iter().rev() {
            let Some(stored) = events.get(id) else {
                continue;
            };
            if filter.matches(&stored.record) {
                matches.push(stored.clone());
                if cap.is_some_and(|cap| matches.len() >= cap) {
                    break;
                }
            }
        }
        matches
    }

    /// Deletes matching records with `created_at < before`, walking the time
    /// index in ascending order and stopping past the boundary.
    pub fn evict(&self, filter: &Filter, before: Timestamp) -> Result<usize> {
        let mut events = self.events.write();
        let mut time_index = self.time_index.write();

        let mut doomed: Vec<(Timestamp, String)> = Vec::new();
        for (created_at, id) in time_index.iter() {
            if *created_at >= before {
                break;
            }
            if let Some(stored) = events.get(id) {
                if filter.matches(&stored.record) {
                    doomed.push((*created_at, id.clone()));
                }
            }
        }

        for (created_at, id) in &doomed {
            events.remove(id);
            time_index.remove(&(*created_at, id.clone()));
            self.file.append(&RangeEntry::Delete(id.clone()))?;
        }
        Ok(doomed.len())
    }

    /// Drops records older than the retention window and compacts the log.
    /// Runs periodically in the background; callable directly.
    pub fn sweep(&self) -> Result<usize> {
        let boundary = Timestamp(Timestamp::now().0 - RETENTION_SECS);
        let mut events = self.events.write();
        let mut time_index = self.time_index.write();

        let mut expired: Vec<(Timestamp, String)> = Vec::new();
        for (created_at, id) in time_index.iter() {
            if *created_at >= boundary {
                break;
            }
            expired.push((*created_at, id.clone()));
        }
        for (created_at, id) in &expired {
            events.remove(id);
            time_index.remove(&(*created_at, id.clone()));
        }

        let remaining: Vec<RangeEntry> = events
            .values()
            .cloned()
            .map(RangeEntry::Put)
            .collect();
        self.file.rewrite(&remaining)?;
        Ok(expired.len())
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

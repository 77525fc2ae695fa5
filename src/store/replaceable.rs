//! Latest-write-wins cache of replaceable records.

use super::database::{Database, StoreFile};
use super::SweepHandle;
use crate::error::{Error, Result};
use crate::types::{epoch_millis, EventRecord, KIND_CONTACTS, KIND_PROFILE, KIND_RELAY_LIST};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

/// Record kinds cached here, each in its own logical store.
const KIND_STORES: &[(u32, &str)] = &[
    (KIND_PROFILE, "profiles"),
    (KIND_CONTACTS, "contacts"),
    (KIND_RELAY_LIST, "relay-lists"),
];

const SWEEP_INITIAL_DELAY: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Cached wrappers older than this are dropped by the sweep, tombstones
/// included, so a later lookup can retry the network.
const RETENTION_MILLIS: i64 = 30 * 24 * 60 * 60 * 1000;

/// One persisted wrapper: a value, or a tombstone remembering "resolved,
/// found nothing".
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: Option<EventRecord>,
    added_at: i64,
}

/// Outcome of a cache lookup. `Unqueried` (no entry at all) is distinct
/// from `Absent` (a tombstone: the lookup already happened and found
/// nothing).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Unqueried,
    Absent,
    Found(EventRecord),
}

struct LogicalStore {
    file: StoreFile,
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl LogicalStore {
    /// Applies one replayed or incoming entry with last-write-wins rules.
    /// Returns false when the incumbent wins and nothing changed.
    fn apply(entries: &mut HashMap<String, StoredEntry>, entry: StoredEntry) -> bool {
        let incumbent_wins = match entries.get(&entry.key) {
            None => false,
            Some(existing) => match (&existing.value, &entry.value) {
                // Tombstones never displace anything; they only fill absence.
                (_, None) => true,
                (Some(current), Some(incoming)) => current.created_at >= incoming.created_at,
                (None, Some(_)) => false,
            },
        };
        if incumbent_wins {
            return false;
        }
        entries.insert(entry.key.clone(), entry);
        true
    }
}

/// Durable key → latest-value store for replaceable records.
///
/// Each author has at most one live record per `(kind, identifier)`; the
/// record with the greatest `created_at` wins and ties favor the incumbent.
pub struct ReplaceableRecordStore {
    stores: HashMap<u32, LogicalStore>,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl ReplaceableRecordStore {
    /// Opens every per-kind logical store and starts the retention sweep.
    pub fn open(db: &Database) -> Result<Arc<Self>> {
        let mut stores = HashMap::new();
        for (kind, name) in KIND_STORES {
            let file = db.open_store(name)?;
            let mut entries = HashMap::new();
            for entry in file.replay::<StoredEntry>()? {
                LogicalStore::apply(&mut entries, entry);
            }
            stores.insert(
                *kind,
                LogicalStore {
                    file,
                    entries: RwLock::new(entries),
                },
            );
        }

        let store = Arc::new(Self {
            stores,
            sweeper: Mutex::new(None),
        });
        let weak: Weak<Self> = Arc::downgrade(&store);
        let handle = SweepHandle::spawn(
            "replaceable",
            SWEEP_INITIAL_DELAY,
            SWEEP_INTERVAL,
            move || match weak.upgrade() {
                Some(store) => {
                    if let Err(e) = store.sweep() {
                        warn!(error = %e, "replaceable-store sweep failed");
                    }
                    true
                }
                None => false,
            },
        )?;
        *store.sweeper.lock() = Some(handle);
        Ok(store)
    }

    fn logical(&self, kind: u32) -> Result<&LogicalStore> {
        self.stores.get(&kind).ok_or(Error::StoreNotRegistered(kind))
    }

    fn entry_key(author: &str, identifier: Option<&str>) -> String {
        match identifier {
            Some(identifier) if !identifier.is_empty() => format!("{author}:{identifier}"),
            _ => author.to_string(),
        }
    }

    /// Stores `record` unless an equal-or-newer record is already cached.
    /// Returns whichever record is live afterwards.
    pub fn put(&self, record: EventRecord) -> Result<EventRecord> {
        let store = self.logical(record.kind)?;
        let key = Self::entry_key(&record.author, Some(record.identifier()));

        let mut entries = store.entries.write();
        if let Some(current) = entries.get(&key).and_then(|e| e.value.as_ref()) {
            if current.created_at >= record.created_at {
                return Ok(current.clone());
            }
        }
        let entry = StoredEntry {
            key: key.clone(),
            value: Some(record.clone()),
            added_at: epoch_millis(),
        };
        entries.insert(key, entry.clone());
        store.file.append(&entry)?;
        Ok(record)
    }

    /// Remembers "looked up, found nothing" for a key, but only when nothing
    /// is cached yet; an existing value or tombstone is left alone.
    pub fn put_tombstone(&self, author: &str, kind: u32, identifier: Option<&str>) -> Result<()> {
        let store = self.logical(kind)?;
        let key = Self::entry_key(author, identifier);

        let mut entries = store.entries.write();
        if entries.contains_key(&key) {
            return Ok(());
        }
        let entry = StoredEntry {
            key: key.clone(),
            value: None,
            added_at: epoch_millis(),
        };
        entries.insert(key, entry.clone());
        store.file.append(&entry)?;
        Ok(())
    }

    /// Looks up the cached value for `(author, kind, identifier)`.
    pub fn get(&self, author: &str, kind: u32, identifier: Option<&str>) -> Result<Lookup> {
        let store = self.logical(kind)?;
        let key = Self::entry_key(author, identifier);
        Ok(match store.entries.read().get(&key) {
            None => Lookup::Unqueried,
            Some(StoredEntry { value: None, .. }) => Lookup::Absent,
            Some(StoredEntry {
                value: Some(record),
                ..
            }) => Lookup::Found(record.clone()),
        })
    }

    /// Batch lookup, output aligned to `authors`. The whole batch fails only
    /// when the kind has no store; per-key problems cannot occur beyond
    /// "unqueried".
    pub fn get_many(&self, authors: &[String], kind: u32) -> Result<Vec<Lookup>> {
        let store = self.logical(kind)?;
        let entries = store.entries.read();
        Ok(authors
            .iter()
            .map(|author| match entries.get(author.as_str()) {
                None => Lookup::Unqueried,
                Some(StoredEntry { value: None, .. }) => Lookup::Absent,
                Some(StoredEntry {
                    value: Some(record),
                    ..
                }) => Lookup::Found(record.clone()),
            })
            .collect())
    }

    /// Drops wrappers past the retention window and compacts each store
    /// file. Runs periodically in the background; callable directly.
    pub fn sweep(&self) -> Result<usize> {
        let boundary = epoch_millis() - RETENTION_MILLIS;
        let mut removed = 0;
        for store in self.stores.values() {
            let mut entries = store.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| entry.added_at >= boundary);
            removed += before - entries.len();
            let remaining: Vec<StoredEntry> = entries.values().cloned().collect();
            store.file.rewrite(&remaining)?;
        }
        Ok(removed)
    }
}

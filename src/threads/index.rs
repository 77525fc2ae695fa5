//! In-memory reply graph built incrementally from subscription output.

use crate::store::RangeEventStore;
use crate::tags;
use crate::types::{CanonicalKey, EventRecord, Filter};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Which listener table an id belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerScope {
    Thread,
    Descendants,
}

/// Handle for removing a registered listener.
#[derive(Clone, Debug)]
pub struct ListenerId {
    scope: ListenerScope,
    key: CanonicalKey,
    serial: u64,
}

struct ListenerEntry {
    serial: u64,
    callback: Callback,
}

/// Deduplicated adjacency map of reply records, keyed by parent identity.
///
/// Records are inserted under exactly one parent key, determined once at
/// ingestion and never re-parented. Children may arrive before their parent;
/// since edges are keyed by parent identity rather than parent object, a
/// late-arriving parent needs no adoption step.
pub struct ThreadIndex {
    /// parent key -> direct children, in arrival order.
    children: RwLock<HashMap<CanonicalKey, Arc<Vec<EventRecord>>>>,

    /// child key -> parent key, for ancestor-chain notification.
    parents: RwLock<HashMap<CanonicalKey, CanonicalKey>>,

    /// Canonical keys already ingested (cross-source dedup).
    processed: RwLock<HashSet<CanonicalKey>>,

    /// Per-parent-key mutation counters.
    thread_versions: RwLock<HashMap<CanonicalKey, u64>>,

    /// Dataset-wide mutation counter.
    version: AtomicU64,

    /// Memoized descendant closures, cleared wholesale on any mutation.
    closures: RwLock<HashMap<CanonicalKey, Arc<HashMap<CanonicalKey, Vec<EventRecord>>>>>,

    thread_listeners: RwLock<HashMap<CanonicalKey, Vec<ListenerEntry>>>,
    descendant_listeners: RwLock<HashMap<CanonicalKey, Vec<ListenerEntry>>>,
    next_listener: AtomicU64,

    /// Durability side-channel; ingested records are appended best-effort.
    durable: Option<Arc<RangeEventStore>>,

    empty: Arc<Vec<EventRecord>>,
}

impl ThreadIndex {
    pub fn new(durable: Option<Arc<RangeEventStore>>) -> Self {
        Self {
            children: RwLock::new(HashMap::new()),
            parents: RwLock::new(HashMap::new()),
            processed: RwLock::new(HashSet::new()),
            thread_versions: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            closures: RwLock::new(HashMap::new()),
            thread_listeners: RwLock::new(HashMap::new()),
            descendant_listeners: RwLock::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            durable,
            empty: Arc::new(Vec::new()),
        }
    }

    // --- Ingestion ---

    /// Ingests a batch of records with no provenance information.
    pub fn ingest(&self, records: &[EventRecord]) -> usize {
        let batch: Vec<(EventRecord, Vec<String>)> =
            records.iter().map(|r| (r.clone(), Vec::new())).collect();
        self.ingest_batch(batch, true)
    }

    /// Ingests a batch along with the relay URLs each record was seen on.
    pub fn ingest_with_provenance(&self, batch: Vec<(EventRecord, Vec<String>)>) -> usize {
        self.ingest_batch(batch, true)
    }

    /// Batch ingestion core. Mutations are applied atomically relative to
    /// listener notification: the whole batch lands, then the closure cache
    /// is invalidated once and listeners fire once.
    fn ingest_batch(&self, batch: Vec<(EventRecord, Vec<String>)>, persist: bool) -> usize {
        let mut touched: Vec<CanonicalKey> = Vec::new();
        let mut accepted: Vec<(EventRecord, Vec<String>)> = Vec::new();

        {
            let mut children = self.children.write();
            let mut parents = self.parents.write();
            let mut processed = self.processed.write();
            let mut versions = self.thread_versions.write();

            for (record, provenance) in batch {
                let key = record.canonical_key();
                if processed.contains(&key) {
                    continue;
                }
                let Some(parent_ref) = tags::parent_reference(&record) else {
                    debug!(id = %record.id, kind = record.kind, "record is not reply-shaped");
                    continue;
                };
                let parent_key = parent_ref.canonical_key();

                processed.insert(key.clone());
                let siblings = children.entry(parent_key.clone()).or_default();
                Arc::make_mut(siblings).push(record.clone());
                parents.insert(key, parent_key.clone());
                *versions.entry(parent_key.clone()).or_insert(0) += 1;
                touched.push(parent_key);
                accepted.push((record, provenance));
            }

            if !accepted.is_empty() {
                self.closures.write().clear();
                self.version.fetch_add(1, Ordering::SeqCst);
            }
        }

        if accepted.is_empty() {
            return 0;
        }

        if persist {
            if let Some(store) = &self.durable {
                if let Err(e) = store.append(&accepted) {
                    warn!(error = %e, "durable write of ingested records failed");
                }
            }
        }

        self.notify(&touched);
        accepted.len()
    }

    /// Cold-start hydration: pull matching records out of the durable store
    /// and index them without writing them back.
    pub fn hydrate(&self, filters: &[Filter]) -> usize {
        let Some(store) = &self.durable else {
            return 0;
        };
        let mut batch: Vec<(EventRecord, Vec<String>)> = Vec::new();
        for filter in filters {
            for stored in store.query_range(filter, None) {
                batch.push((stored.record, stored.provenance));
            }
        }
        self.ingest_batch(batch, false)
    }

    /// Drops the whole graph. Listener registrations survive and are
    /// notified once.
    pub fn clear(&self) {
        let notify_keys: Vec<CanonicalKey>;
        {
            let mut children = self.children.write();
            let mut parents = self.parents.write();
            let mut processed = self.processed.write();
            let mut versions = self.thread_versions.write();

            notify_keys = children.keys().cloned().collect();
            children.clear();
            parents.clear();
            processed.clear();
            versions.clear();
            self.closures.write().clear();
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        self.notify(&notify_keys);
    }

    // --- Queries ---

    /// Direct children of `key`, in arrival order. The returned `Arc` is
    /// stable while the thread is unchanged, so callers can compare
    /// snapshots cheaply.
    pub fn get_thread(&self, key: &CanonicalKey) -> Arc<Vec<EventRecord>> {
        self.children
            .read()
            .get(key)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.empty))
    }

    /// Mutation counter for one thread key (0 when never touched).
    pub fn thread_version(&self, key: &CanonicalKey) -> u64 {
        self.thread_versions.read().get(key).copied().unwrap_or(0)
    }

    /// Dataset-wide mutation counter.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Number of records indexed so far.
    pub fn record_count(&self) -> usize {
        self.processed.read().len()
    }

    /// Full transitive reply tree below `key`: every reachable parent key
    /// mapped to its direct children. Built on first access after an
    /// invalidation, then memoized until the next mutation anywhere.
    pub fn get_descendant_closure(
        &self,
        key: &CanonicalKey,
    ) -> Arc<HashMap<CanonicalKey, Vec<EventRecord>>> {
        if let Some(cached) = self.closures.read().get(key) {
            return Arc::clone(cached);
        }

        let version = self.version.load(Ordering::SeqCst);
        let mut map: HashMap<CanonicalKey, Vec<EventRecord>> = HashMap::new();
        {
            let children = self.children.read();
            let mut queue = vec![key.clone()];
            let mut visited: HashSet<CanonicalKey> = HashSet::new();
            while let Some(current) = queue.pop() {
                if !visited.insert(current.clone()) {
                    continue;
                }
                if let Some(kids) = children.get(&current) {
                    map.insert(current, kids.as_ref().clone());
                    for child in kids.iter() {
                        queue.push(child.canonical_key());
                    }
                }
            }
        }

        let closure = Arc::new(map);
        // Only memoize when no mutation raced the build; a stale entry must
        // never be served.
        let mut cache = self.closures.write();
        if self.version.load(Ordering::SeqCst) == version {
            cache.insert(key.clone(), Arc::clone(&closure));
        }
        closure
    }

    // --- Listeners ---

    /// Registers a callback fired when the direct children of `key` change.
    pub fn listen_thread(
        &self,
        key: CanonicalKey,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> ListenerId {
        self.register(ListenerScope::Thread, key, Arc::new(callback))
    }

    /// Registers a callback fired when anything in the subtree below `key`
    /// changes (ancestors are notified for every descendant update).
    pub fn listen_all_descendants(
        &self,
        key: CanonicalKey,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> ListenerId {
        self.register(ListenerScope::Descendants, key, Arc::new(callback))
    }

    /// Removes a listener. Keys with no remaining listeners are dropped from
    /// the table.
    pub fn remove_listener(&self, id: &ListenerId) {
        let table = match id.scope {
            ListenerScope::Thread => &self.thread_listeners,
            ListenerScope::Descendants => &self.descendant_listeners,
        };
        let mut table = table.write();
        if let Some(entries) = table.get_mut(&id.key) {
            entries.retain(|e| e.serial != id.serial);
            if entries.is_empty() {
                table.remove(&id.key);
            }
        }
    }

    fn register(&self, scope: ListenerScope, key: CanonicalKey, callback: Callback) -> ListenerId {
        let serial = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let table = match scope {
            ListenerScope::Thread => &self.thread_listeners,
            ListenerScope::Descendants => &self.descendant_listeners,
        };
        table
            .write()
            .entry(key.clone())
            .or_default()
            .push(ListenerEntry { serial, callback });
        ListenerId { scope, key, serial }
    }

    /// Fires thread listeners on the touched parent keys and descendant
    /// listeners on every ancestor up the chain. Callbacks run outside the
    /// index locks.
    fn notify(&self, touched: &[CanonicalKey]) {
        let mut callbacks: Vec<Callback> = Vec::new();
        {
            let parents = self.parents.read();
            let thread_listeners = self.thread_listeners.read();
            let descendant_listeners = self.descendant_listeners.read();

            let mut direct: HashSet<&CanonicalKey> = HashSet::new();
            for key in touched {
                if direct.insert(key) {
                    if let Some(entries) = thread_listeners.get(key) {
                        callbacks.extend(entries.iter().map(|e| Arc::clone(&e.callback)));
                    }
                }
            }

            let mut notified: HashSet<CanonicalKey> = HashSet::new();
            for key in touched {
                let mut current = Some(key.clone());
                while let Some(k) = current {
                    if !notified.insert(k.clone()) {
                        break;
                    }
                    if let Some(entries) = descendant_listeners.get(&k) {
                        callbacks.extend(entries.iter().map(|e| Arc::clone(&e.callback)));
                    }
                    current = parents.get(&k).cloned();
                }
            }
        }

        for callback in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Timestamp, KIND_NOTE};
    use std::sync::atomic::AtomicUsize;

    fn reply(id: &str, parent: &str, created_at: i64) -> EventRecord {
        EventRecord {
            id: id.into(),
            author: "alice".into(),
            kind: KIND_NOTE,
            created_at: Timestamp(created_at),
            tags: vec![
                vec!["e".into(), "r1".into(), String::new(), "root".into()],
                vec!["e".into(), parent.into(), String::new(), "reply".into()],
            ],
            content: String::new(),
        }
    }

    fn root_reply(id: &str, root: &str, created_at: i64) -> EventRecord {
        EventRecord {
            id: id.into(),
            author: "alice".into(),
            kind: KIND_NOTE,
            created_at: Timestamp(created_at),
            tags: vec![vec!["e".into(), root.into(), String::new(), "root".into()]],
            content: String::new(),
        }
    }

    fn key(s: &str) -> CanonicalKey {
        CanonicalKey::from(s)
    }

    #[test]
    fn test_ingest_builds_threads() {
        let index = ThreadIndex::new(None);
        index.ingest(&[root_reply("c1", "r1", 1010), root_reply("c2", "r1", 1005)]);

        let thread = index.get_thread(&key("r1"));
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].id, "c1");
        assert_eq!(thread[1].id, "c2");
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let index = ThreadIndex::new(None);
        let record = root_reply("c1", "r1", 1010);

        assert_eq!(index.ingest(&[record.clone()]), 1);
        assert_eq!(index.ingest(&[record.clone(), record.clone()]), 0);
        assert_eq!(index.get_thread(&key("r1")).len(), 1);
        assert_eq!(index.record_count(), 1);
    }

    #[test]
    fn test_non_reply_records_are_skipped() {
        let index = ThreadIndex::new(None);
        let mut plain = root_reply("c1", "r1", 1010);
        plain.tags.clear();

        assert_eq!(index.ingest(&[plain]), 0);
        assert_eq!(index.version(), 0);
    }

    #[test]
    fn test_stable_snapshot_until_changed() {
        let index = ThreadIndex::new(None);
        index.ingest(&[root_reply("c1", "r1", 1010)]);

        let a = index.get_thread(&key("r1"));
        let b = index.get_thread(&key("r1"));
        assert!(Arc::ptr_eq(&a, &b));
        let v = index.thread_version(&key("r1"));

        index.ingest(&[root_reply("c2", "r1", 1011)]);
        let c = index.get_thread(&key("r1"));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(index.thread_version(&key("r1")), v + 1);
        // The old snapshot is untouched.
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_orphan_tolerance() {
        let forward = ThreadIndex::new(None);
        forward.ingest(&[root_reply("c1", "r1", 1010)]);
        forward.ingest(&[reply("c3", "c1", 1020)]);

        let reversed = ThreadIndex::new(None);
        reversed.ingest(&[reply("c3", "c1", 1020)]);
        reversed.ingest(&[root_reply("c1", "r1", 1010)]);

        let a = forward.get_descendant_closure(&key("r1"));
        let b = reversed.get_descendant_closure(&key("r1"));
        assert_eq!(a.len(), b.len());
        assert_eq!(
            a.get(&key("c1")).map(|v| v.len()),
            b.get(&key("c1")).map(|v| v.len())
        );
    }

    #[test]
    fn test_descendant_closure_contents() {
        let index = ThreadIndex::new(None);
        index.ingest(&[
            reply("c3", "c1", 1020),
            root_reply("c1", "r1", 1010),
            root_reply("c2", "r1", 1005),
        ]);

        let closure = index.get_descendant_closure(&key("r1"));
        assert_eq!(closure.len(), 2);
        let direct: Vec<&str> = closure[&key("r1")].iter().map(|r| r.id.as_str()).collect();
        assert_eq!(direct, vec!["c1", "c2"]);
        let nested: Vec<&str> = closure[&key("c1")].iter().map(|r| r.id.as_str()).collect();
        assert_eq!(nested, vec!["c3"]);
    }

    #[test]
    fn test_closure_memoized_and_invalidated() {
        let index = ThreadIndex::new(None);
        index.ingest(&[root_reply("c1", "r1", 1010)]);

        let a = index.get_descendant_closure(&key("r1"));
        let b = index.get_descendant_closure(&key("r1"));
        assert!(Arc::ptr_eq(&a, &b));

        index.ingest(&[reply("c3", "c1", 1020)]);
        let c = index.get_descendant_closure(&key("r1"));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(c.contains_key(&key("c1")));
    }

    #[test]
    fn test_listeners_fire_up_the_ancestor_chain() {
        let index = ThreadIndex::new(None);
        index.ingest(&[root_reply("c1", "r1", 1010)]);

        let direct_fired = Arc::new(AtomicUsize::new(0));
        let subtree_fired = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&direct_fired);
        index.listen_thread(key("r1"), move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&subtree_fired);
        index.listen_all_descendants(key("r1"), move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        // A grandchild lands under c1: the direct listener on r1 stays
        // quiet, the subtree listener fires.
        index.ingest(&[reply("c3", "c1", 1020)]);
        assert_eq!(direct_fired.load(Ordering::SeqCst), 0);
        assert_eq!(subtree_fired.load(Ordering::SeqCst), 1);

        // A direct child fires both.
        index.ingest(&[root_reply("c2", "r1", 1005)]);
        assert_eq!(direct_fired.load(Ordering::SeqCst), 1);
        assert_eq!(subtree_fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_batch_notifies_once() {
        let index = ThreadIndex::new(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        index.listen_thread(key("r1"), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        index.ingest(&[
            root_reply("c1", "r1", 1010),
            root_reply("c2", "r1", 1005),
            root_reply("c4", "r1", 1030),
        ]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_listener_stops_firing() {
        let index = ThreadIndex::new(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let id = index.listen_thread(key("r1"), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        index.ingest(&[root_reply("c1", "r1", 1010)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        index.remove_listener(&id);
        index.ingest(&[root_reply("c2", "r1", 1005)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(index.thread_listeners.read().is_empty());
    }

    #[test]
    fn test_clear_resets_graph() {
        let index = ThreadIndex::new(None);
        index.ingest(&[root_reply("c1", "r1", 1010)]);
        let v = index.version();

        index.clear();
        assert!(index.get_thread(&key("r1")).is_empty());
        assert_eq!(index.record_count(), 0);
        assert!(index.version() > v);
    }
}

//! Durable local stores.
//!
//! Both stores share one versioned embedded [`Database`]: a directory with a
//! manifest, an exclusive process lock, and one append-only file per logical
//! store. [`ReplaceableRecordStore`] keeps the newest record per author and
//! type with last-write-wins resolution and tombstones;
//! [`RangeEventStore`] keeps immutable records under a time index with
//! filtered range scans and age-based eviction. Persistence is a durability
//! layer for the in-memory graph, not a source of truth during a session.

mod database;
mod range;
mod replaceable;

pub use database::{Database, DatabaseConfig, SCHEMA_VERSION};
pub use range::{RangeEventStore, StoredEvent};
pub use replaceable::{Lookup, ReplaceableRecordStore};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

/// A background sweep thread with explicit shutdown.
///
/// The first tick runs after `initial`, later ticks every `interval`.
/// Dropping the handle signals the thread and joins it; a tick returning
/// `false` (its store is gone) also stops the loop.
pub(crate) struct SweepHandle {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn spawn(
        name: &'static str,
        initial: Duration,
        interval: Duration,
        mut tick: impl FnMut() -> bool + Send + 'static,
    ) -> std::io::Result<Self> {
        let (shutdown, signal) = bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name(format!("{name}-sweep"))
            .spawn(move || {
                let mut wait = initial;
                loop {
                    match signal.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    if !tick() {
                        return;
                    }
                    wait = interval;
                }
            })?;
        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

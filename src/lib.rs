//! # Weft
//!
//! A reply-thread synchronization engine with a durable multi-relay record
//! cache: the client core of a decentralized event-publishing protocol.
//!
//! ## Core Concepts
//!
//! - **Records**: Immutable, content-addressed units published across many
//!   independent relays, any of which may redeliver the same record
//! - **Roots**: Every conversation anchors to one canonical root, discovered
//!   across three reference conventions and memoized per item
//! - **Threads**: A deduplicated in-memory reply graph, built incrementally
//!   from live subscriptions and served as versioned snapshots
//! - **Stores**: An embedded, versioned database caching latest-write-wins
//!   replaceable records and time-indexed immutable records
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use weft::{
//!     Database, DatabaseConfig, RangeEventStore, ReplaceableRecordStore,
//!     RootResolver, SubscriptionConfig, SubscriptionManager, ThreadIndex,
//!     ThreadItem,
//! };
//!
//! let db = Database::open(DatabaseConfig::default())?;
//! let records = RangeEventStore::open(&db)?;
//! let profiles = ReplaceableRecordStore::open(&db)?;
//! let index = Arc::new(ThreadIndex::new(Some(Arc::clone(&records))));
//! let resolver = Arc::new(RootResolver::new(Arc::clone(&network)));
//!
//! let threads = SubscriptionManager::new(
//!     network,
//!     resolver,
//!     Arc::clone(&index),
//!     Some(profiles),
//!     SubscriptionConfig::default(),
//! );
//!
//! // One live timeline per root, shared by every interested caller.
//! threads.subscribe(&ThreadItem::record(note), 50).await?;
//! let replies = index.get_thread(&root_key);
//! ```

pub mod error;
pub mod net;
pub mod resolver;
pub mod store;
pub mod tags;
pub mod threads;
pub mod types;

// Re-exports
pub use error::{Error, Result};
pub use net::{
    CloseReason, NetworkService, RelayList, TimelineHandle, TimelineKey, TimelineOptions,
    TimelineRequest, TimelineSink,
};
pub use resolver::{RootInfo, RootResolver, ThreadItem};
pub use store::{
    Database, DatabaseConfig, Lookup, RangeEventStore, ReplaceableRecordStore, StoredEvent,
    SCHEMA_VERSION,
};
pub use tags::ParentRef;
pub use threads::{
    ListenerId, SubscriptionConfig, SubscriptionManager, SubscriptionState, SubscriptionStats,
    ThreadIndex,
};
pub use types::*;

//! # order-cache
//!
//! A bounded, crash-recoverable in-memory cache of orders, fed by an at-least-once ingestion pipeline.
//!
//! Think of it as the hot read path in front of an order database.
//!
//! # The Basics
//!
//! - Orders arrive over a message bus, get persisted into a [record store](traits::RecordStore), admitted into the
//!   [cache](OrderCache) and only then acknowledged. A message whose order couldn't be persisted stays
//!   unacknowledged and comes back after the ack wait.
//! - Lookups are served from memory. A miss reads the order through from the store and admits it.
//! - The cache holds at most `capacity` keys in a circular insertion queue. The oldest slot is overwritten first.
//! - Every admission appends a row to a persisted cache log. On startup [`OrderCache::recover()`] replays the most
//!   recent `capacity` rows, restoring the pre-crash view of "most recent orders". A clean shutdown clears the log.
//!
//! # Eviction
//!
//! Eviction reuses a queue slot. By default the record whose slot was reused stays in memory until its key is
//! cached again; the queue, not the map, tells what is recent. Build the
//! [`CacheConfig`](cache::CacheConfig) with `prune_evicted(true)` to bound memory by dropping such records.
//!
//! # Delivery Semantics
//!
//! Persisting is not idempotent. A message redelivered after its order was stored, but before the acknowledgment
//! reached the bus, creates a second copy of the order.
//!
//! # Backends
//!
//! - [`DbStore`](store::DbStore): SQLite or PostgreSQL through SeaORM (features `sqlite` and `pg`).
//! - [`MemoryStore`](store::MemoryStore): in-process, with failure injection.
//!
//! The bus contract is [`bus::MessageBus`]; [`bus::memory`] implements it in process.

pub mod bus;
pub mod cache;
pub mod error;
pub mod ingest;
pub mod recovery;
pub mod store;
pub mod traits;
pub mod types;

#[cfg(feature = "service")]
pub mod app;
#[cfg(feature = "service")]
pub mod publisher;

#[doc(inline)]
pub use cache::OrderCache;
#[doc(inline)]
pub use ingest::OrderIngestor;
#[doc(inline)]
pub use traits::RecordStore;

pub mod prelude {
    pub use crate::bus::MessageBus;
    pub use crate::bus::MessageHandler;
    pub use crate::bus::SubscriptionOptions;
    pub use crate::cache::CacheConfig;
    pub use crate::cache::OrderCache;
    pub use crate::error::*;
    pub use crate::ingest::Disposition;
    pub use crate::ingest::OrderIngestor;
    pub use crate::recovery::RecoveryReport;
    pub use crate::traits::CacheObserver;
    pub use crate::traits::RecordStore;
    pub use crate::types::*;
}

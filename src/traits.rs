use async_trait::async_trait;
use std::sync::Arc;

use crate::error::StoreError;
use crate::recovery::RecoveryReport;
use crate::types::CacheLogRow;
use crate::types::OrderKey;
use crate::types::OrderRecord;

/// Durable backend of the order cache.
///
/// Besides the order records themselves a store keeps an append-only "cache log": one row per cache admission,
/// tagged with the instance key of the application that cached the order. The log only exists to rebuild the cache
/// after a crash.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Persist a full order atomically and return the key assigned to it. Either everything is stored or nothing.
    async fn persist_order(&self, record: &OrderRecord) -> Result<OrderKey, StoreError>;

    /// Fetch an order by key. Must return [`StoreError::NotFound`] when there is no such order.
    async fn fetch_order(&self, key: OrderKey) -> Result<OrderRecord, StoreError>;

    async fn append_cache_log(&self, key: OrderKey, instance_key: &str) -> Result<(), StoreError>;

    /// Up to `limit` most recent log rows of the instance, newest first.
    async fn fetch_recent_cache_log(&self, instance_key: &str, limit: usize) -> Result<Vec<CacheLogRow>, StoreError>;

    /// Drop all log rows of the instance. Returns the number of rows removed.
    async fn clear_cache_log(&self, instance_key: &str) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn persist_order(&self, record: &OrderRecord) -> Result<OrderKey, StoreError> {
        (**self).persist_order(record).await
    }

    async fn fetch_order(&self, key: OrderKey) -> Result<OrderRecord, StoreError> {
        (**self).fetch_order(key).await
    }

    async fn append_cache_log(&self, key: OrderKey, instance_key: &str) -> Result<(), StoreError> {
        (**self).append_cache_log(key, instance_key).await
    }

    async fn fetch_recent_cache_log(&self, instance_key: &str, limit: usize) -> Result<Vec<CacheLogRow>, StoreError> {
        (**self).fetch_recent_cache_log(instance_key, limit).await
    }

    async fn clear_cache_log(&self, instance_key: &str) -> Result<u64, StoreError> {
        (**self).clear_cache_log(instance_key).await
    }
}

/// Hooks into cache events. All methods default to doing nothing.
#[async_trait]
pub trait CacheObserver: Send + Sync + 'static {
    /// A key took queue slot `slot`. `evicted` is the key previously held by the slot, if any.
    async fn on_cached(&self, _key: OrderKey, _slot: usize, _evicted: Option<OrderKey>) {}
    /// The order is cached in memory but its cache log row could not be written.
    async fn on_log_failure(&self, _key: OrderKey, _error: &StoreError) {}
    async fn on_recovered(&self, _report: &RecoveryReport) {}
}

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashSet;
use tracing::debug;
use tracing::instrument;

use crate::error::StoreError;
use crate::traits::RecordStore;
use crate::types::CacheLogRow;
use crate::types::OrderKey;
use crate::types::OrderRecord;

#[derive(Debug)]
struct Inner {
    orders:           BTreeMap<OrderKey, OrderRecord>,
    next_key:         OrderKey,
    // (seq, key, instance key), in append order.
    cache_log:        Vec<(i64, OrderKey, String)>,
    next_seq:         i64,
    failing_persists: usize,
    failing_fetches:  HashSet<OrderKey>,
    failing_log:      bool,
    persist_calls:    usize,
    fetch_calls:      usize,
}

/// In-process [`RecordStore`].
///
/// Besides serving as a database-less backend it can inject failures and count calls, which is what the tests of
/// the cache and of the ingestion pipeline rely upon.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                orders:           BTreeMap::new(),
                next_key:         1,
                cache_log:        Vec::new(),
                next_seq:         1,
                failing_persists: 0,
                failing_fetches:  HashSet::new(),
                failing_log:      false,
                persist_calls:    0,
                fetch_calls:      0,
            }),
        }
    }

    /// Store a record under a given key, bypassing key assignment. Subsequent persists get keys above it.
    pub fn put_order(&self, key: OrderKey, record: OrderRecord) {
        let mut inner = self.inner.lock();
        inner.orders.insert(key, record);
        if inner.next_key <= key {
            inner.next_key = key + 1;
        }
    }

    /// Make the next `count` persists fail without storing anything.
    pub fn fail_next_persists(&self, count: usize) {
        self.inner.lock().failing_persists = count;
    }

    pub fn fail_fetch(&self, key: OrderKey) {
        self.inner.lock().failing_fetches.insert(key);
    }

    pub fn fail_log_appends(&self, fail: bool) {
        self.inner.lock().failing_log = fail;
    }

    pub fn persist_calls(&self) -> usize {
        self.inner.lock().persist_calls
    }

    pub fn fetch_calls(&self) -> usize {
        self.inner.lock().fetch_calls
    }

    pub fn order_count(&self) -> usize {
        self.inner.lock().orders.len()
    }

    /// All stored records with the given order UID, in key order.
    pub fn orders_by_uid(&self, order_uid: &str) -> Vec<OrderKey> {
        self.inner
            .lock()
            .orders
            .iter()
            .filter(|(_, record)| record.order_uid == order_uid)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Keys of the instance's cache log, oldest first.
    pub fn cache_log(&self, instance_key: &str) -> Vec<OrderKey> {
        self.inner
            .lock()
            .cache_log
            .iter()
            .filter(|(_, _, instance)| instance == instance_key)
            .map(|(_, key, _)| *key)
            .collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    #[instrument(level = "trace", skip(self, record))]
    async fn persist_order(&self, record: &OrderRecord) -> Result<OrderKey, StoreError> {
        let mut inner = self.inner.lock();
        inner.persist_calls += 1;

        if inner.failing_persists > 0 {
            inner.failing_persists -= 1;
            return Err(StoreError::Backend(format!("injected failure persisting {record}")));
        }

        let key = inner.next_key;
        inner.next_key += 1;
        inner.orders.insert(key, record.clone());
        debug!("{record} persisted as #{key}");

        Ok(key)
    }

    async fn fetch_order(&self, key: OrderKey) -> Result<OrderRecord, StoreError> {
        let mut inner = self.inner.lock();
        inner.fetch_calls += 1;

        if inner.failing_fetches.contains(&key) {
            return Err(StoreError::Backend(format!("injected failure fetching order #{key}")));
        }

        inner.orders.get(&key).cloned().ok_or(StoreError::NotFound(key))
    }

    async fn append_cache_log(&self, key: OrderKey, instance_key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        if inner.failing_log {
            return Err(StoreError::Backend(format!("injected failure logging order #{key}")));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.cache_log.push((seq, key, instance_key.to_string()));

        Ok(())
    }

    async fn fetch_recent_cache_log(&self, instance_key: &str, limit: usize) -> Result<Vec<CacheLogRow>, StoreError> {
        Ok(self
            .inner
            .lock()
            .cache_log
            .iter()
            .rev()
            .filter(|(_, _, instance)| instance == instance_key)
            .take(limit)
            .map(|(seq, key, _)| CacheLogRow { seq: *seq, key: *key })
            .collect())
    }

    async fn clear_cache_log(&self, instance_key: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let before = inner.cache_log.len();
        inner.cache_log.retain(|(_, _, instance)| instance != instance_key);
        Ok((before - inner.cache_log.len()) as u64)
    }
}

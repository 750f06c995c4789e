use fieldx::fxstruct;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use crate::error::LookupError;
use crate::error::StoreError;
use crate::traits::CacheObserver;
use crate::traits::RecordStore;
use crate::types::OrderKey;
use crate::types::OrderRecord;
use crate::types::OrderSummary;

/// Configuration of an [`OrderCache`].
///
/// ```ignore
/// let config = CacheConfig::builder().capacity(1000).instance_key("api-1").build()?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[fxstruct(no_new, default, builder, get(copy))]
#[serde(default)]
pub struct CacheConfig {
    /// Number of queue slots. Zero disables caching: every read goes to the store.
    #[fieldx(default(10))]
    capacity:      usize,
    /// Scopes the persisted cache log to one application instance.
    #[fieldx(get(copy(off)), builder(into), default("default".to_string()))]
    instance_key:  String,
    /// Drop a record from memory once its key no longer occupies any queue slot. When off, records whose slot got
    /// reused stay in memory until overwritten by the same key.
    #[fieldx(default(false))]
    prune_evicted: bool,
}

// Entries, queue and cursor are only ever touched together, under one lock.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) entries: HashMap<OrderKey, OrderRecord>,
    pub(crate) queue:   Vec<Option<OrderKey>>,
    pub(crate) pos:     usize,
}

impl CacheState {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            queue:   vec![None; capacity],
            pos:     0,
        }
    }

    // Returns the slot taken by the key and the key previously held by that slot.
    fn admit(&mut self, key: OrderKey, record: OrderRecord, prune: bool) -> (usize, Option<OrderKey>) {
        let slot = self.pos;
        let evicted = self.queue[slot].replace(key);
        self.pos = (slot + 1) % self.queue.len();

        if prune {
            if let Some(old_key) = evicted {
                if old_key != key && !self.queue.contains(&Some(old_key)) {
                    self.entries.remove(&old_key);
                }
            }
        }

        self.entries.insert(key, record);
        (slot, evicted)
    }

    // The slot at the cursor is the next to be overwritten, hence the oldest one.
    fn chronological(&self) -> Vec<OrderKey> {
        self.queue[self.pos..]
            .iter()
            .chain(self.queue[..self.pos].iter())
            .flatten()
            .copied()
            .collect()
    }
}

/// Bounded in-memory order cache with FIFO-by-insertion eviction over a circular queue of keys.
///
/// Reads are read-through: a miss fetches the order from the [`RecordStore`] and admits it. Every admission is
/// also recorded in the store's cache log, which is what [`recover()`](OrderCache::recover) replays after a crash.
///
/// ```ignore
/// let config = CacheConfig::builder().capacity(1000).instance_key("api-1").build()?;
/// let cache = Arc::new(OrderCache::builder().store(store).config(config).build()?);
/// cache.recover().await?;
///
/// match cache.get(key).await {
///     Ok(summary) => render(summary),
///     Err(LookupError::NotFound(_)) => not_found(),
///     Err(err) => internal_error(err),
/// }
/// ```
#[fxstruct(
    no_new,
    default(off),
    get,
    builder(
        post_build,
        doc("Builder object of [`OrderCache`].", "", "See [`OrderCache::builder()`] method."),
        method_doc("Implement builder pattern for [`OrderCache`]."),
    )
)]
pub struct OrderCache<S>
where
    S: RecordStore, {
    #[fieldx(builder(required, into))]
    store:     Arc<S>,
    #[fieldx(default(CacheConfig::default()))]
    config:    CacheConfig,
    #[fieldx(optional, get(as_ref))]
    observer:  Arc<dyn CacheObserver>,
    #[fieldx(private, get(off), builder(off))]
    state:     RwLock<CacheState>,
    // Serializes admissions with their log appends so that log order always matches queue order. Readers never
    // touch it.
    #[fieldx(private, get(off), builder(off))]
    log_order: tokio::sync::Mutex<()>,
}

impl<S> OrderCache<S>
where
    S: RecordStore,
{
    fn post_build(mut self) -> Self {
        self.state = RwLock::new(CacheState::new(self.config.capacity()));
        self
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity()
    }

    pub fn instance_key(&self) -> &str {
        self.config.instance_key()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.capacity() > 0
    }

    /// Number of records held in memory. Without pruning this can exceed the capacity.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    pub fn contains(&self, key: OrderKey) -> bool {
        self.state.read().entries.contains_key(&key)
    }

    /// Physical layout of the insertion queue.
    pub fn slots(&self) -> Vec<Option<OrderKey>> {
        self.state.read().queue.clone()
    }

    /// Keys of the insertion queue, oldest first.
    pub fn recent_keys(&self) -> Vec<OrderKey> {
        self.state.read().chronological()
    }

    /// Index of the next slot to overwrite.
    pub fn cursor(&self) -> usize {
        self.state.read().pos
    }

    pub(crate) fn replace_state(&self, state: CacheState) {
        *self.state.write() = state;
    }

    /// Look an order up and return its summary.
    pub async fn get(&self, key: OrderKey) -> Result<OrderSummary, LookupError> {
        Ok(self.get_record(key).await?.summary())
    }

    /// Same read-through path as [`get()`](Self::get) but returns the full record.
    #[instrument(level = "trace", skip(self))]
    pub async fn get_record(&self, key: OrderKey) -> Result<OrderRecord, LookupError> {
        let cached = {
            let state = self.state.read();
            state.entries.get(&key).cloned()
        };

        if let Some(record) = cached {
            debug!("order #{key} served from cache");
            return Ok(record);
        }

        let record = self
            .store
            .fetch_order(key)
            .await
            .map_err(|err| LookupError::from_store(key, err))?;

        // The failure is already reported by put() and doesn't invalidate the record we've got.
        let _ = self.put(key, record.clone()).await;
        debug!("order #{key} served from store");

        Ok(record)
    }

    /// Admit a record into the cache and append a cache log row for it.
    ///
    /// An error means the log row could not be written. The record is in memory regardless.
    ///
    /// Admissions are serialized together with their log appends, so concurrent writers queue up behind the store's
    /// append latency. Lookups that hit the cache are not affected.
    #[instrument(level = "trace", skip(self, record))]
    pub async fn put(&self, key: OrderKey, record: OrderRecord) -> Result<(), StoreError> {
        if !self.is_enabled() {
            trace!("cache is disabled, order #{key} is not cached");
            return Ok(());
        }

        let (slot, evicted, logged) = {
            let _log_guard = self.log_order.lock().await;
            let (slot, evicted) = self.state.write().admit(key, record, self.config.prune_evicted());
            debug!(slot, ?evicted, "order #{key} cached");
            (slot, evicted, self.store.append_cache_log(key, self.instance_key()).await)
        };

        if let Some(observer) = self.observer() {
            observer.on_cached(key, slot, evicted).await;
        }

        if let Err(err) = logged {
            warn!("order #{key} is cached but its cache log row is lost: {err}");
            if let Some(observer) = self.observer() {
                observer.on_log_failure(key, &err).await;
            }
            return Err(err);
        }

        Ok(())
    }

    /// Clean shutdown: forget the cache log of this instance. Never called on a crash path, which is what keeps the
    /// log available for recovery.
    #[instrument(level = "trace", skip(self))]
    pub async fn finish(&self) -> Result<u64, StoreError> {
        let removed = self.store.clear_cache_log(self.instance_key()).await?;
        info!("Cache log of '{}' cleared; rows={removed}", self.instance_key());
        Ok(removed)
    }
}

impl<S> Debug for OrderCache<S>
where
    S: RecordStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("OrderCache")
            .field("instance_key", &self.instance_key())
            .field("capacity", &self.capacity())
            .field("entries", &state.entries.len())
            .field("queue", &state.queue)
            .field("pos", &state.pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::sample_order;
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn config(capacity: usize, prune_evicted: bool) -> CacheConfig {
        CacheConfig::builder()
            .capacity(capacity)
            .prune_evicted(prune_evicted)
            .build()
            .unwrap()
    }

    fn cache_with(store: &Arc<MemoryStore>, capacity: usize) -> OrderCache<MemoryStore> {
        OrderCache::builder()
            .store(store.clone())
            .config(config(capacity, false))
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        cached:       parking_lot::Mutex<Vec<(OrderKey, usize, Option<OrderKey>)>>,
        log_failures: parking_lot::Mutex<Vec<OrderKey>>,
    }

    #[async_trait]
    impl CacheObserver for Recorder {
        async fn on_cached(&self, key: OrderKey, slot: usize, evicted: Option<OrderKey>) {
            self.cached.lock().push((key, slot, evicted));
        }

        async fn on_log_failure(&self, key: OrderKey, _error: &StoreError) {
            self.log_failures.lock().push(key);
        }
    }

    #[tokio::test]
    async fn ring_overwrites_the_oldest_slot() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, 3);

        for key in 1..=4 {
            cache.put(key, sample_order(&format!("o{key}"), &[10])).await.unwrap();
        }

        assert_eq!(cache.slots(), vec![Some(4), Some(2), Some(3)]);
        assert_eq!(cache.cursor(), 1);
        assert_eq!(cache.recent_keys(), vec![2, 3, 4]);
        assert_eq!(store.cache_log("default"), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn evicted_records_stay_in_memory_unless_pruned() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, 2);
        for key in 1..=3 {
            cache.put(key, sample_order("o", &[1])).await.unwrap();
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(1));

        let pruning = OrderCache::<MemoryStore>::builder()
            .store(store.clone())
            .config(config(2, true))
            .build()
            .unwrap();
        for key in 1..=3 {
            pruning.put(key, sample_order("o", &[1])).await.unwrap();
        }
        assert_eq!(pruning.len(), 2);
        assert!(!pruning.contains(1));
        assert_eq!(pruning.recent_keys(), vec![2, 3]);
    }

    #[tokio::test]
    async fn pruning_keeps_keys_still_queued_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let cache = OrderCache::<MemoryStore>::builder().store(store).config(config(3, true)).build().unwrap();
        for key in [1, 2, 1, 3] {
            cache.put(key, sample_order("o", &[1])).await.unwrap();
        }
        assert_eq!(cache.slots(), vec![Some(3), Some(2), Some(1)]);
        assert!(cache.contains(1));
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn zero_capacity_never_caches() {
        let store = Arc::new(MemoryStore::new());
        let key = store.persist_order(&sample_order("z", &[5])).await.unwrap();
        let cache = cache_with(&store, 0);

        cache.put(key, sample_order("z", &[5])).await.unwrap();
        assert!(cache.is_empty());
        assert!(cache.slots().is_empty());
        assert!(store.cache_log("default").is_empty());

        for expected_fetches in 1..=3 {
            assert_eq!(cache.get(key).await.unwrap().total_price, 5);
            assert_eq!(store.fetch_calls(), expected_fetches);
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn missing_order_is_not_found_and_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, 3);

        assert!(matches!(cache.get(42).await, Err(LookupError::NotFound(42))));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.cursor(), 0);
    }

    #[tokio::test]
    async fn miss_reads_through_and_admits() {
        let store = Arc::new(MemoryStore::new());
        let key = store.persist_order(&sample_order("rt", &[100, 200])).await.unwrap();
        let cache = cache_with(&store, 3);

        let summary = cache.get(key).await.unwrap();
        assert_eq!(summary.order_uid, "rt");
        assert_eq!(summary.total_price, 300);
        assert_eq!(store.fetch_calls(), 1);

        assert!(cache.contains(key));
        cache.get(key).await.unwrap();
        assert_eq!(store.fetch_calls(), 1, "second lookup must be a hit");
        assert_eq!(cache.recent_keys(), vec![key]);
    }

    #[tokio::test]
    async fn storage_failure_is_typed_and_caches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let key = store.persist_order(&sample_order("broken", &[1])).await.unwrap();
        store.fail_fetch(key);
        let cache = cache_with(&store, 3);

        assert!(matches!(
            cache.get(key).await,
            Err(LookupError::Storage { key: k, .. }) if k == key
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn log_failure_is_reported_but_record_is_cached() {
        let store = Arc::new(MemoryStore::new());
        store.fail_log_appends(true);
        let recorder = Arc::new(Recorder::default());
        let cache = OrderCache::<MemoryStore>::builder()
            .store(store.clone())
            .config(config(2, false))
            .observer(recorder.clone())
            .build()
            .unwrap();

        assert!(cache.put(7, sample_order("o", &[1])).await.is_err());
        assert!(cache.contains(7));
        assert_eq!(*recorder.log_failures.lock(), vec![7]);
        assert_eq!(*recorder.cached.lock(), vec![(7, 0, None)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_keep_queue_and_log_consistent() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(cache_with(&store, 16));

        let mut tasks = tokio::task::JoinSet::new();
        for t in 0..8 {
            let cache = cache.clone();
            tasks.spawn(async move {
                for i in 0..50 {
                    let key = t * 1000 + i;
                    cache.put(key, sample_order("c", &[1])).await.unwrap();
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        let recent = cache.recent_keys();
        assert_eq!(recent.len(), 16);
        assert_eq!(recent.iter().collect::<HashSet<_>>().len(), 16);

        // The log must agree with the queue on what the most recent keys are and in which order.
        let mut logged = store
            .fetch_recent_cache_log("default", 16)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.key)
            .collect::<Vec<_>>();
        logged.reverse();
        assert_eq!(logged, recent);

        for key in 100_000..100_016 {
            cache.put(key, sample_order("s", &[1])).await.unwrap();
        }
        assert_eq!(cache.recent_keys(), (100_000..100_016).collect::<Vec<_>>());
    }

    #[test]
    fn config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.capacity(), 10);
        assert_eq!(config.instance_key(), "default");
        assert!(!config.prune_evicted());

        let built = CacheConfig::builder().instance_key("api-1").build().unwrap();
        assert_eq!(built.capacity(), 10);
        assert_eq!(built.instance_key(), "api-1");

        let cache = OrderCache::<MemoryStore>::builder().store(Arc::new(MemoryStore::new())).build().unwrap();
        assert_eq!(cache.capacity(), 10);
        assert_eq!(cache.instance_key(), "default");
        assert_eq!(cache.slots(), vec![None; 10]);
        assert!(cache.observer().is_none());
    }

    // An observer that looks back into the cache from its hook must not stall the writers behind it.
    struct Inspector {
        cache: parking_lot::Mutex<Option<Arc<OrderCache<MemoryStore>>>>,
        seen:  parking_lot::Mutex<Vec<(OrderKey, Vec<OrderKey>)>>,
    }

    #[async_trait]
    impl CacheObserver for Inspector {
        async fn on_cached(&self, key: OrderKey, _slot: usize, _evicted: Option<OrderKey>) {
            let cache = self.cache.lock().clone();
            if let Some(cache) = cache {
                if key % 2 == 0 {
                    cache.put(key + 1, sample_order("nested", &[1])).await.unwrap();
                }
                self.seen.lock().push((key, cache.recent_keys()));
            }
        }
    }

    #[tokio::test]
    async fn observer_runs_after_the_admission_is_logged() {
        let store = Arc::new(MemoryStore::new());
        let inspector = Arc::new(Inspector {
            cache: parking_lot::Mutex::new(None),
            seen:  parking_lot::Mutex::new(vec![]),
        });
        let cache = Arc::new(
            OrderCache::builder()
                .store(store.clone())
                .config(config(4, false))
                .observer(inspector.clone())
                .build()
                .unwrap(),
        );
        *inspector.cache.lock() = Some(cache.clone());

        tokio::time::timeout(std::time::Duration::from_secs(5), cache.put(2, sample_order("o", &[1])))
            .await
            .expect("put from an observer hook must not deadlock")
            .unwrap();

        assert_eq!(cache.recent_keys(), vec![2, 3]);
        assert_eq!(store.cache_log("default"), vec![2, 3]);
        assert_eq!(*inspector.seen.lock(), vec![(3, vec![2, 3]), (2, vec![2, 3])]);

        // Break the cycle between the cache and its observer.
        inspector.cache.lock().take();
    }
}

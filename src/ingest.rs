use async_trait::async_trait;
use fieldx::fxstruct;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::bus::Message;
use crate::bus::MessageBus;
use crate::bus::MessageHandler;
use crate::bus::Subscription;
use crate::bus::SubscriptionOptions;
use crate::cache::OrderCache;
use crate::error::BusError;
use crate::error::IngestError;
use crate::traits::RecordStore;
use crate::types::OrderKey;
use crate::types::OrderRecord;

/// What to tell the bus about a processed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave the message unacknowledged so that the bus redelivers it.
    Retry,
}

/// Turns order messages into persisted and cached orders.
///
/// A message is acknowledged once its order is both persisted and admitted into the cache. A payload that cannot be
/// decoded is acknowledged and dropped since no redelivery would fix it. A failure to persist leaves the message
/// unacknowledged; the bus redelivers it after the ack wait. Persisting is not idempotent, so a message redelivered
/// after a successful persist produces a duplicate order.
///
/// ```ignore
/// let ingestor = Arc::new(OrderIngestor::builder().cache(cache).build()?);
/// let subscription = ingestor.subscribe(bus, options).await?;
/// ```
#[derive(Debug)]
#[fxstruct(no_new, builder)]
pub struct OrderIngestor<S>
where
    S: RecordStore, {
    #[fieldx(get, builder(required, into))]
    cache:   Arc<OrderCache<S>>,
    #[fieldx(private, get(off), builder(off))]
    acked:   AtomicU64,
    #[fieldx(private, get(off), builder(off))]
    dropped: AtomicU64,
    #[fieldx(private, get(off), builder(off))]
    retried: AtomicU64,
}

impl<S> OrderIngestor<S>
where
    S: RecordStore,
{
    /// Messages the bus confirmed as acknowledged, dropped ones included.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    /// Malformed messages acknowledged without effect.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages left for redelivery.
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Decode, persist and cache one order.
    pub async fn ingest(&self, payload: &[u8]) -> Result<OrderKey, IngestError> {
        let record: OrderRecord = serde_json::from_slice(payload)?;
        let key = self.cache.store().persist_order(&record).await?;

        // A lost cache log row doesn't hold the ack back; put() has reported it already.
        if self.cache.put(key, record).await.is_err() {
            debug!("order #{key} acknowledged without a cache log row");
        }

        Ok(key)
    }

    /// Decide the fate of one message. Acknowledging it is left to the caller.
    #[instrument(level = "trace", skip_all, fields(bytes = payload.len()))]
    pub async fn process(&self, payload: &[u8]) -> Disposition {
        match self.ingest(payload).await {
            Ok(key) => {
                debug!("order #{key} ingested");
                Disposition::Ack
            }
            Err(IngestError::Decode(err)) => {
                warn!("Dropping malformed order message: {err}");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Disposition::Ack
            }
            Err(IngestError::Storage(err)) => {
                warn!("Order not persisted, leaving the message for redelivery: {err}");
                self.retried.fetch_add(1, Ordering::Relaxed);
                Disposition::Retry
            }
        }
    }

    pub async fn subscribe<B: MessageBus>(
        self: &Arc<Self>,
        bus: Arc<B>,
        options: SubscriptionOptions,
    ) -> Result<IngestSubscription<B>, BusError> {
        let handler: Arc<dyn MessageHandler> = self.clone();
        let subscription = bus.subscribe(options, handler).await?;
        Ok(IngestSubscription { bus, subscription })
    }
}

#[async_trait]
impl<S> MessageHandler for OrderIngestor<S>
where
    S: RecordStore,
{
    async fn handle(&self, message: Message) {
        match self.process(message.data()).await {
            Disposition::Ack => match message.ack() {
                Ok(()) => {
                    self.acked.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    warn!("Message #{} not acknowledged: {err}", message.sequence());
                }
            },
            Disposition::Retry => {
                debug!("message #{} left unacknowledged", message.sequence());
            }
        }
    }
}

/// A live ingestion subscription.
pub struct IngestSubscription<B>
where
    B: MessageBus, {
    bus:          Arc<B>,
    subscription: Subscription,
}

impl<B> IngestSubscription<B>
where
    B: MessageBus,
{
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub async fn unsubscribe(self) -> Result<(), BusError> {
        self.bus.unsubscribe(self.subscription).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::bus::AckHandle;
    use crate::bus::MessageId;
    use crate::store::memory::MemoryStore;
    use crate::types::sample_order;
    use parking_lot::Mutex;

    fn ingestor(capacity: usize) -> (Arc<MemoryStore>, OrderIngestor<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = OrderCache::builder()
            .store(store.clone())
            .config(CacheConfig::builder().capacity(capacity).build().unwrap())
            .build()
            .unwrap();
        let ingestor = OrderIngestor::builder().cache(Arc::new(cache)).build().unwrap();
        (store, ingestor)
    }

    // Records acknowledgments; refuses them all once the subscription is "gone".
    #[derive(Default)]
    struct Acks {
        gone:  bool,
        acked: Mutex<Vec<MessageId>>,
    }

    impl AckHandle for Acks {
        fn ack(&self, sequence: MessageId) -> Result<(), BusError> {
            if self.gone {
                return Err(BusError::SubscriptionGone(sequence));
            }
            self.acked.lock().push(sequence);
            Ok(())
        }
    }

    fn message(seq: MessageId, data: Vec<u8>, acks: &Arc<Acks>) -> Message {
        Message::new("orders".to_string(), seq, data, false, acks.clone())
    }

    fn payload(uid: &str) -> Vec<u8> {
        serde_json::to_vec(&sample_order(uid, &[120, 80])).unwrap()
    }

    #[tokio::test]
    async fn malformed_payload_is_acked_without_effects() {
        let (store, ingestor) = ingestor(3);

        assert_eq!(ingestor.process(b"{\"order_uid\": 12").await, Disposition::Ack);
        assert_eq!(store.persist_calls(), 0);
        assert!(ingestor.cache().is_empty());
        assert_eq!(ingestor.cache().cursor(), 0);
        assert_eq!(ingestor.dropped(), 1);
        assert_eq!(ingestor.acked(), 0, "processing alone acknowledges nothing");
    }

    #[tokio::test]
    async fn persist_failure_means_retry_and_no_cache_change() {
        let (store, ingestor) = ingestor(3);
        store.fail_next_persists(1);

        assert_eq!(ingestor.process(&payload("p")).await, Disposition::Retry);
        assert!(ingestor.cache().is_empty());
        assert!(store.cache_log("default").is_empty());
        assert_eq!(ingestor.retried(), 1);

        assert_eq!(ingestor.process(&payload("p")).await, Disposition::Ack);
        assert_eq!(store.orders_by_uid("p").len(), 1);
    }

    #[tokio::test]
    async fn success_persists_then_caches() {
        let (store, ingestor) = ingestor(3);

        assert_eq!(ingestor.process(&payload("ok")).await, Disposition::Ack);
        assert_eq!(store.order_count(), 1);
        assert!(ingestor.cache().contains(1));
        assert_eq!(store.cache_log("default"), vec![1]);
        assert_eq!(ingestor.cache().get(1).await.unwrap().total_price, 200);
        assert_eq!(store.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn lost_log_row_does_not_block_ack() {
        let (store, ingestor) = ingestor(3);
        store.fail_log_appends(true);

        assert_eq!(ingestor.process(&payload("nolog")).await, Disposition::Ack);
        assert!(ingestor.cache().contains(1));
        assert!(store.cache_log("default").is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_still_persists() {
        let (store, ingestor) = ingestor(0);

        assert_eq!(ingestor.process(&payload("c0")).await, Disposition::Ack);
        assert_eq!(store.order_count(), 1);
        assert!(ingestor.cache().is_empty());
    }

    #[tokio::test]
    async fn acked_counts_only_confirmed_acks() {
        let (store, ingestor) = ingestor(3);
        let bus = Arc::new(Acks::default());

        ingestor.handle(message(1, payload("a"), &bus)).await;
        ingestor.handle(message(2, b"garbage".to_vec(), &bus)).await;
        assert_eq!(*bus.acked.lock(), vec![1, 2]);
        assert_eq!(ingestor.acked(), 2);
        assert_eq!(ingestor.dropped(), 1);

        store.fail_next_persists(1);
        ingestor.handle(message(3, payload("b"), &bus)).await;
        assert_eq!(*bus.acked.lock(), vec![1, 2]);
        assert_eq!(ingestor.acked(), 2);
        assert_eq!(ingestor.retried(), 1);

        // The order is in, but the bus no longer takes the acknowledgment.
        let gone = Arc::new(Acks {
            gone: true,
            ..Default::default()
        });
        ingestor.handle(message(4, payload("c"), &gone)).await;
        assert_eq!(store.orders_by_uid("c").len(), 1);
        assert_eq!(ingestor.acked(), 2);
    }
}

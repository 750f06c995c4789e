use fake::Fake;
use rand::Rng;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;

use crate::bus::MessageBus;
use crate::bus::MessageId;
use crate::error::AppError;
use crate::types::Item;
use crate::types::OrderRecord;
use crate::types::Payment;

const CURRENCIES: &[&str] = &["RUB", "USD", "EUR", "KZT"];
const DELIVERY_SERVICES: &[&str] = &["meest", "cdek", "boxberry", "wb"];
const BANKS: &[&str] = &["alpha", "sber", "tinkoff", "vtb"];

/// A plausible random order.
pub fn sample_order() -> OrderRecord {
    let mut rng = rand::rng();

    let order_uid = format!("{:016x}test", rng.random::<u64>());
    let track_number = format!("WB{:010}", rng.random_range(0..10_000_000_000u64));

    let items = (0..rng.random_range(1..=4))
        .map(|_| {
            let price = rng.random_range(100..20_000i64);
            let sale = rng.random_range(0..=50i32);
            Item {
                chrt_id: rng.random_range(1_000_000..10_000_000),
                price,
                rid: format!("{:016x}test", rng.random::<u64>()),
                name: fake::faker::lorem::en::Word().fake::<String>(),
                sale,
                size: rng.random_range(0..=5).to_string(),
                total_price: price * (100 - sale as i64) / 100,
                nm_id: rng.random_range(1_000_000..10_000_000),
                brand: fake::faker::company::en::CompanyName().fake::<String>(),
            }
        })
        .collect::<Vec<_>>();

    let goods_total = items.iter().map(|i| i.total_price).sum::<i64>();
    let delivery_cost = rng.random_range(0..3_000i64);

    OrderRecord {
        order_uid: order_uid.clone(),
        entry: "WBIL".to_string(),
        internal_signature: String::new(),
        payment: Payment {
            transaction: order_uid,
            currency: CURRENCIES[rng.random_range(0..CURRENCIES.len())].to_string(),
            provider: "wbpay".to_string(),
            amount: goods_total + delivery_cost,
            payment_dt: rng.random_range(1_600_000_000..1_700_000_000),
            bank: BANKS[rng.random_range(0..BANKS.len())].to_string(),
            delivery_cost,
            goods_total,
        },
        items,
        locale: "en".to_string(),
        customer_id: fake::faker::internet::en::Username().fake::<String>(),
        track_number,
        delivery_service: DELIVERY_SERVICES[rng.random_range(0..DELIVERY_SERVICES.len())].to_string(),
        shardkey: rng.random_range(0..10).to_string(),
        sm_id: rng.random_range(1..100),
    }
}

/// Publishes orders onto the bus. Used to feed a demo service and tests; not part of the ingestion path.
pub struct OrderPublisher<B>
where
    B: MessageBus, {
    bus:     Arc<B>,
    subject: String,
}

impl<B> OrderPublisher<B>
where
    B: MessageBus,
{
    pub fn new<S: ToString>(bus: Arc<B>, subject: S) -> Self {
        Self {
            bus,
            subject: subject.to_string(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn publish_order(&self, record: &OrderRecord) -> Result<MessageId, AppError> {
        let payload = serde_json::to_vec(record)?;
        Ok(self.bus.publish(&self.subject, payload).await?)
    }

    /// Publish in the background and only log the outcome.
    pub fn publish_detached(&self, record: OrderRecord) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let subject = self.subject.clone();

        tokio::spawn(async move {
            let outcome = match serde_json::to_vec(&record) {
                Ok(payload) => bus.publish(&subject, payload).await.map_err(AppError::from),
                Err(err) => Err(err.into()),
            };

            match outcome {
                Ok(id) => info!("{record} published on '{subject}' as #{id}"),
                Err(err) => error!("Failed to publish {record}: {err}"),
            }
        })
    }

    pub async fn publish_samples(&self, count: usize) -> Result<Vec<MessageId>, AppError> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.publish_order(&sample_order()).await?);
        }
        Ok(ids)
    }
}

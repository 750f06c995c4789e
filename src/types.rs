use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// Store-assigned identifier of a persisted order.
pub type OrderKey = i64;

/// Payment details of an order. Owned by its [`OrderRecord`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub transaction:   String,
    pub currency:      String,
    pub provider:      String,
    pub amount:        i64,
    /// Unix timestamp of the moment the order was paid.
    pub payment_dt:    i64,
    pub bank:          String,
    pub delivery_cost: i64,
    pub goods_total:   i64,
}

/// A single line of an order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub chrt_id:     i64,
    pub price:       i64,
    pub rid:         String,
    pub name:        String,
    pub sale:        i32,
    pub size:        String,
    pub total_price: i64,
    pub nm_id:       i64,
    pub brand:       String,
}

/// The full denormalized order as it arrives from the bus and as it is kept in the cache.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_uid:          String,
    pub entry:              String,
    pub internal_signature: String,
    pub payment:            Payment,
    pub items:              Vec<Item>,
    pub locale:             String,
    pub customer_id:        String,
    pub track_number:       String,
    pub delivery_service:   String,
    pub shardkey:           String,
    pub sm_id:              i64,
}

impl OrderRecord {
    /// Sum of the item totals. Orders without items fall back to the payment amount.
    pub fn total_price(&self) -> i64 {
        if self.items.is_empty() {
            self.payment.amount
        }
        else {
            self.items.iter().map(|i| i.total_price).sum()
        }
    }

    pub fn summary(&self) -> OrderSummary {
        OrderSummary {
            order_uid:        self.order_uid.clone(),
            entry:            self.entry.clone(),
            customer_id:      self.customer_id.clone(),
            track_number:     self.track_number.clone(),
            delivery_service: self.delivery_service.clone(),
            total_price:      self.total_price(),
        }
    }
}

impl Display for OrderRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "order '{}' ({} items)", self.order_uid, self.items.len())
    }
}

/// Read-side projection of an [`OrderRecord`]. Computed on every lookup, never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_uid:        String,
    pub entry:            String,
    pub customer_id:      String,
    pub track_number:     String,
    pub delivery_service: String,
    pub total_price:      i64,
}

/// One row of the persisted cache log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheLogRow {
    /// Store-assigned sequence id; larger means more recent.
    pub seq: i64,
    pub key: OrderKey,
}

#[cfg(test)]
pub(crate) fn sample_order(uid: &str, totals: &[i64]) -> OrderRecord {
    OrderRecord {
        order_uid: uid.to_string(),
        entry: "WBIL".to_string(),
        internal_signature: String::new(),
        payment: Payment {
            transaction: uid.to_string(),
            currency: "RUB".to_string(),
            provider: "wbpay".to_string(),
            amount: totals.iter().sum(),
            payment_dt: 1_637_907_727,
            bank: "alpha".to_string(),
            delivery_cost: 1500,
            goods_total: totals.iter().sum(),
        },
        items: totals
            .iter()
            .enumerate()
            .map(|(i, total)| Item {
                chrt_id: i as i64 + 1,
                price: *total,
                rid: format!("{uid}-{i}"),
                name: format!("item {i}"),
                sale: 0,
                size: "0".to_string(),
                total_price: *total,
                nm_id: 2_389_212,
                brand: "Vivienne Sabo".to_string(),
            })
            .collect(),
        locale: "en".to_string(),
        customer_id: "test".to_string(),
        track_number: "WBILMTESTTRACK".to_string(),
        delivery_service: "meest".to_string(),
        shardkey: "9".to_string(),
        sm_id: 99,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_price_sums_items() {
        let order = sample_order("a", &[100, 250, 7]);
        assert_eq!(order.total_price(), 357);
        assert_eq!(order.summary().total_price, 357);
    }

    #[test]
    fn total_price_without_items_uses_payment() {
        let mut order = sample_order("b", &[]);
        order.payment.amount = 42;
        assert_eq!(order.total_price(), 42);
    }

    #[test]
    fn decodes_incoming_json() {
        let json = r#"{
            "order_uid": "b563feb7b2b84b6test",
            "entry": "WBIL",
            "internal_signature": "",
            "payment": {
                "transaction": "b563feb7b2b84b6test", "currency": "USD", "provider": "wbpay",
                "amount": 1817, "payment_dt": 1637907727, "bank": "alpha",
                "delivery_cost": 1500, "goods_total": 317
            },
            "items": [{
                "chrt_id": 9934930, "price": 453, "rid": "ab4219087a764ae0btest", "name": "Mascaras",
                "sale": 30, "size": "0", "total_price": 317, "nm_id": 2389212, "brand": "Vivienne Sabo"
            }],
            "locale": "en",
            "customer_id": "test",
            "track_number": "WBILMTESTTRACK",
            "delivery_service": "meest",
            "shardkey": "9",
            "sm_id": 99
        }"#;
        let order: OrderRecord = serde_json::from_str(json).expect("valid order JSON");
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.summary().total_price, 317);
        assert_eq!(order.payment.delivery_cost, 1500);
    }
}

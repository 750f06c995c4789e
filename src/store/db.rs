use async_trait::async_trait;
use sea_orm::ActiveValue::NotSet;
use sea_orm::ActiveValue::Set;
use sea_orm::ColumnTrait;
use sea_orm::DatabaseConnection;
use sea_orm::DatabaseTransaction;
use sea_orm::DbErr;
use sea_orm::EntityTrait;
use sea_orm::QueryFilter;
use sea_orm::QueryOrder;
use sea_orm::QuerySelect;
use sea_orm::TransactionTrait;
use tracing::debug;
use tracing::instrument;

use super::driver::DatabaseDriver;
use super::entity::cache_log;
use super::entity::item;
use super::entity::order;
use super::entity::order_item;
use super::entity::payment;
use crate::error::StoreError;
use crate::traits::RecordStore;
use crate::types::CacheLogRow;
use crate::types::Item;
use crate::types::OrderKey;
use crate::types::OrderRecord;
use crate::types::Payment;

/// Relational [`RecordStore`]. An order is spread over `items`, `payments`, `orders` and `order_items`; the cache
/// log lives in `cache_log`.
#[derive(Debug, Clone)]
pub struct DbStore {
    connection: DatabaseConnection,
}

impl DbStore {
    /// The schema is expected to be migrated already.
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    pub fn from_driver<D: DatabaseDriver + ?Sized>(driver: &D) -> Self {
        Self::new(driver.connection())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    async fn insert_order(transaction: &DatabaseTransaction, record: &OrderRecord) -> Result<OrderKey, DbErr> {
        let mut item_ids = Vec::with_capacity(record.items.len());
        for item in &record.items {
            let res = item::Entity::insert(item::ActiveModel {
                id:          NotSet,
                chrt_id:     Set(item.chrt_id),
                price:       Set(item.price),
                rid:         Set(item.rid.clone()),
                name:        Set(item.name.clone()),
                sale:        Set(item.sale),
                size:        Set(item.size.clone()),
                total_price: Set(item.total_price),
                nm_id:       Set(item.nm_id),
                brand:       Set(item.brand.clone()),
            })
            .exec(transaction)
            .await?;
            item_ids.push(res.last_insert_id);
        }

        let pay = &record.payment;
        let payment_id = payment::Entity::insert(payment::ActiveModel {
            id:            NotSet,
            transaction:   Set(pay.transaction.clone()),
            currency:      Set(pay.currency.clone()),
            provider:      Set(pay.provider.clone()),
            amount:        Set(pay.amount),
            payment_dt:    Set(pay.payment_dt),
            bank:          Set(pay.bank.clone()),
            delivery_cost: Set(pay.delivery_cost),
            goods_total:   Set(pay.goods_total),
        })
        .exec(transaction)
        .await?
        .last_insert_id;

        let order_id = order::Entity::insert(order::ActiveModel {
            id:                 NotSet,
            order_uid:          Set(record.order_uid.clone()),
            entry:              Set(record.entry.clone()),
            internal_signature: Set(record.internal_signature.clone()),
            payment_id:         Set(payment_id),
            locale:             Set(record.locale.clone()),
            customer_id:        Set(record.customer_id.clone()),
            track_number:       Set(record.track_number.clone()),
            delivery_service:   Set(record.delivery_service.clone()),
            shardkey:           Set(record.shardkey.clone()),
            sm_id:              Set(record.sm_id),
        })
        .exec(transaction)
        .await?
        .last_insert_id;

        if !item_ids.is_empty() {
            order_item::Entity::insert_many(item_ids.into_iter().map(|item_id| order_item::ActiveModel {
                order_id: Set(order_id),
                item_id:  Set(item_id),
            }))
            .exec_without_returning(transaction)
            .await?;
        }

        Ok(order_id)
    }
}

#[async_trait]
impl RecordStore for DbStore {
    #[instrument(level = "trace", skip(self, record), fields(order_uid = %record.order_uid))]
    async fn persist_order(&self, record: &OrderRecord) -> Result<OrderKey, StoreError> {
        let transaction = self.connection.begin().await?;
        // On error the transaction is dropped, which rolls it back.
        let key = Self::insert_order(&transaction, record).await?;
        transaction.commit().await?;
        debug!("{record} persisted as #{key}");
        Ok(key)
    }

    #[instrument(level = "trace", skip(self))]
    async fn fetch_order(&self, key: OrderKey) -> Result<OrderRecord, StoreError> {
        let Some(order) = order::Entity::find_by_id(key).one(&self.connection).await?
        else {
            return Err(StoreError::NotFound(key));
        };

        let pay = payment::Entity::find_by_id(order.payment_id)
            .one(&self.connection)
            .await?
            .ok_or_else(|| {
                StoreError::Backend(format!(
                    "order #{key} refers to missing payment #{}",
                    order.payment_id
                ))
            })?;

        let item_ids = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(key))
            .all(&self.connection)
            .await?
            .into_iter()
            .map(|link| link.item_id)
            .collect::<Vec<_>>();

        let items = if item_ids.is_empty() {
            vec![]
        }
        else {
            item::Entity::find()
                .filter(item::Column::Id.is_in(item_ids))
                .order_by_asc(item::Column::Id)
                .all(&self.connection)
                .await?
        };

        Ok(OrderRecord {
            order_uid:          order.order_uid,
            entry:              order.entry,
            internal_signature: order.internal_signature,
            payment:            Payment {
                transaction:   pay.transaction,
                currency:      pay.currency,
                provider:      pay.provider,
                amount:        pay.amount,
                payment_dt:    pay.payment_dt,
                bank:          pay.bank,
                delivery_cost: pay.delivery_cost,
                goods_total:   pay.goods_total,
            },
            items:              items
                .into_iter()
                .map(|row| Item {
                    chrt_id:     row.chrt_id,
                    price:       row.price,
                    rid:         row.rid,
                    name:        row.name,
                    sale:        row.sale,
                    size:        row.size,
                    total_price: row.total_price,
                    nm_id:       row.nm_id,
                    brand:       row.brand,
                })
                .collect(),
            locale:             order.locale,
            customer_id:        order.customer_id,
            track_number:       order.track_number,
            delivery_service:   order.delivery_service,
            shardkey:           order.shardkey,
            sm_id:              order.sm_id,
        })
    }

    #[instrument(level = "trace", skip(self))]
    async fn append_cache_log(&self, key: OrderKey, instance_key: &str) -> Result<(), StoreError> {
        cache_log::Entity::insert(cache_log::ActiveModel {
            id:       NotSet,
            order_id: Set(key),
            app_key:  Set(instance_key.to_string()),
        })
        .exec(&self.connection)
        .await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn fetch_recent_cache_log(&self, instance_key: &str, limit: usize) -> Result<Vec<CacheLogRow>, StoreError> {
        Ok(cache_log::Entity::find()
            .filter(cache_log::Column::AppKey.eq(instance_key))
            .order_by_desc(cache_log::Column::Id)
            .limit(limit as u64)
            .all(&self.connection)
            .await?
            .into_iter()
            .map(|row| CacheLogRow {
                seq: row.id,
                key: row.order_id,
            })
            .collect())
    }

    #[instrument(level = "trace", skip(self))]
    async fn clear_cache_log(&self, instance_key: &str) -> Result<u64, StoreError> {
        Ok(cache_log::Entity::delete_many()
            .filter(cache_log::Column::AppKey.eq(instance_key))
            .exec(&self.connection)
            .await?
            .rows_affected)
    }
}

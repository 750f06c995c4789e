#![cfg(all(feature = "sqlite", feature = "service"))]

use std::sync::Arc;

use order_cache::app::OrderServiceApp;
use order_cache::prelude::*;
use order_cache::publisher::sample_order;
use order_cache::store::driver::sqlite::Sqlite;
use order_cache::store::entity::item;
use order_cache::store::entity::order;
use order_cache::store::entity::payment;
use order_cache::store::DatabaseDriver;
use order_cache::store::DbStore;
use sea_orm::ConnectionTrait;
use sea_orm::EntityTrait;
use sea_orm::PaginatorTrait;

fn config(capacity: usize, instance_key: &str) -> Result<CacheConfig, Box<dyn std::error::Error>> {
    Ok(CacheConfig::builder()
        .capacity(capacity)
        .instance_key(instance_key)
        .build()?)
}

async fn memory_store() -> Result<(Sqlite, DbStore), Box<dyn std::error::Error>> {
    let driver = Sqlite::connect_memory().await?;
    driver.prepare().await?;
    let store = DbStore::from_driver(&driver);
    Ok((driver, store))
}

#[tokio::test]
async fn orders_survive_the_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let (_driver, store) = memory_store().await?;

    let first = sample_order();
    let second = sample_order();
    let k1 = store.persist_order(&first).await?;
    let k2 = store.persist_order(&second).await?;
    assert_ne!(k1, k2);

    assert_eq!(store.fetch_order(k1).await?, first);
    assert_eq!(store.fetch_order(k2).await?, second);
    assert_eq!(store.fetch_order(k2).await?.total_price(), second.payment.goods_total);

    Ok(())
}

#[tokio::test]
async fn unknown_order_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let (_driver, store) = memory_store().await?;

    assert!(matches!(store.fetch_order(42).await, Err(StoreError::NotFound(42))));

    let cache = OrderCache::<DbStore>::builder()
        .store(Arc::new(store))
        .config(config(2, "default")?)
        .build()?;
    assert!(matches!(cache.get(42).await, Err(LookupError::NotFound(42))));
    assert!(cache.is_empty());

    Ok(())
}

#[tokio::test]
async fn cache_log_is_newest_first_and_per_instance() -> Result<(), Box<dyn std::error::Error>> {
    let (_driver, store) = memory_store().await?;

    for key in [5, 6, 7, 8] {
        store.append_cache_log(key, "a").await?;
    }
    store.append_cache_log(100, "b").await?;

    let recent = store.fetch_recent_cache_log("a", 3).await?;
    assert_eq!(recent.iter().map(|r| r.key).collect::<Vec<_>>(), vec![8, 7, 6]);
    assert!(recent.windows(2).all(|w| w[0].seq > w[1].seq));

    assert_eq!(store.clear_cache_log("a").await?, 4);
    assert!(store.fetch_recent_cache_log("a", 10).await?.is_empty());
    assert_eq!(store.fetch_recent_cache_log("b", 10).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn failed_persist_leaves_nothing_behind() -> Result<(), Box<dyn std::error::Error>> {
    let (driver, store) = memory_store().await?;

    // The last insert of an order goes into order_items; make it fail.
    driver.connection().execute_unprepared("DROP TABLE order_items;").await?;

    let err = store.persist_order(&sample_order()).await;
    assert!(matches!(err, Err(StoreError::Database(_))));

    let db = store.connection();
    assert_eq!(order::Entity::find().count(db).await?, 0);
    assert_eq!(payment::Entity::find().count(db).await?, 0);
    assert_eq!(item::Entity::find().count(db).await?, 0);

    Ok(())
}

#[tokio::test]
async fn cache_recovers_from_the_database_log() -> Result<(), Box<dyn std::error::Error>> {
    let (_driver, store) = memory_store().await?;
    let store = Arc::new(store);
    let api_config = config(3, "api-1")?;

    let live = OrderCache::<DbStore>::builder().store(store.clone()).config(api_config.clone()).build()?;
    let mut keys = vec![];
    for _ in 0..4 {
        let record = sample_order();
        let key = store.persist_order(&record).await?;
        live.put(key, record).await?;
        keys.push(key);
    }
    drop(live);

    let restarted = OrderCache::<DbStore>::builder().store(store.clone()).config(api_config).build()?;
    let report = restarted.recover().await?;
    assert_eq!(report.rows, 3);
    assert_eq!(report.cursor, 0);
    assert_eq!(restarted.slots(), keys[1..].iter().copied().map(Some).collect::<Vec<_>>());
    assert!(!restarted.contains(keys[0]));

    restarted.finish().await?;
    assert!(store.fetch_recent_cache_log("api-1", 3).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn service_ingests_and_looks_up() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("orders.db");
    let db_path = db_path.to_string_lossy().to_string();

    let app = OrderServiceApp::builder()
        .cli_args(vec![
            "service_test",
            "--sqlite",
            "--sqlite-path",
            db_path.as_str(),
            "--once",
            "--demo-orders=3",
            "--lookup=1,2,99",
            "--ack-wait=2",
        ])
        .build()?;
    app.execute().await?;

    assert_eq!(app.ingested(), 3);
    assert_eq!(app.found().len(), 2);
    assert!(app.recovery().is_some_and(|r| r.is_cold_start()));

    // The log was cleared on shutdown, the orders were not.
    let app = OrderServiceApp::builder()
        .cli_args(vec![
            "service_test",
            "--sqlite",
            "--sqlite-path",
            db_path.as_str(),
            "--once",
            "--lookup=1,2,3",
        ])
        .build()?;
    app.execute().await?;

    assert_eq!(app.ingested(), 0);
    assert_eq!(app.found().len(), 3);
    assert!(app.recovery().is_some_and(|r| r.is_cold_start()));

    Ok(())
}

//! End-to-end scenarios over the public API, against the in-memory backend.
//!
//! The same scenarios run against Postgres in `postgres_integration.rs`.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;

use cellar::store::MemoryStore;
use cellar::{
    Config, InventoryObservation, InventoryStore, MigrationApplier, MigrationLedger,
    PriceHistoryStore, ProductCatalog, StoreError,
};

fn at(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, 0, 0, 0).unwrap()
}

#[tokio::test]
async fn test_canonical_migrations_apply_once() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let mut config = Config::from_lookup(|_| None).unwrap();
    config.migrations_dir = root.clone();
    config.base_schema = Some(root.join("base").join("base_schema.sql"));

    let store = MemoryStore::new();
    let applier = MigrationApplier::new(&store, &config);

    let first = applier.run().await.unwrap();
    assert_eq!(
        first.applied,
        vec!["0001_price_history.sql", "0002_inventory.sql"]
    );

    let second = applier.run().await.unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(store.list_applied().await.unwrap().len(), 2);

    for record in store.list_applied().await.unwrap() {
        assert_eq!(record.content_hash.len(), 64);
    }
}

#[tokio::test]
async fn test_adhoc_file_never_enters_ledger() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("0001_init.sql"), "CREATE TABLE t (id int);").unwrap();
    std::fs::write(dir.path().join("0002_add_col.sql"), "ALTER TABLE t ADD c int;").unwrap();
    std::fs::write(dir.path().join("2025-01-01-adhoc.sql"), "DELETE FROM t;").unwrap();

    let mut config = Config::from_lookup(|_| None).unwrap();
    config.migrations_dir = dir.path().to_path_buf();
    let store = MemoryStore::new();
    MigrationApplier::new(&store, &config).run().await.unwrap();

    let names: Vec<String> = store
        .list_applied()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.filename)
        .collect();
    assert_eq!(names, vec!["0001_init.sql", "0002_add_col.sql"]);
}

#[tokio::test]
async fn test_price_scenario_produces_contiguous_intervals() {
    let store = MemoryStore::new();
    store.ensure_product("W001", Some("Barolo 2019")).await.unwrap();

    store
        .record_price("W001", Some(Decimal::new(100000, 2)), at(1, 1))
        .await
        .unwrap();
    store
        .record_price("W001", Some(Decimal::new(120000, 2)), at(2, 1))
        .await
        .unwrap();

    let history = store.price_history("W001").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].effective_to, Some(history[1].effective_from));
    assert!(history[1].is_open());

    assert_eq!(
        store.price_as_of("W001", at(1, 31)).await.unwrap(),
        Some(Decimal::new(100000, 2))
    );
    assert_eq!(
        store.price_as_of("W001", at(2, 1)).await.unwrap(),
        Some(Decimal::new(120000, 2))
    );
    let before = at(1, 1) - chrono::Duration::seconds(1);
    assert_eq!(store.price_as_of("W001", before).await.unwrap(), None);
}

#[tokio::test]
async fn test_backdated_change_is_rejected() {
    let store = MemoryStore::new();
    store.ensure_product("W001", None).await.unwrap();
    store
        .record_price("W001", Some(Decimal::new(1000, 0)), at(3, 1))
        .await
        .unwrap();

    let err = store
        .record_price("W001", Some(Decimal::new(900, 0)), at(2, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::OutOfOrderObservation { .. }));
    assert_eq!(store.price_history("W001").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_keep_one_open_interval_per_code() {
    let store = Arc::new(MemoryStore::new());
    let codes = ["W001", "W002", "W003"];
    for code in codes {
        store.ensure_product(code, None).await.unwrap();
    }

    // Newest observations are spawned first so arrivals interleave out of order.
    let mut handles = Vec::new();
    for step in (1..=10u32).rev() {
        for (i, code) in codes.iter().enumerate() {
            let store = Arc::clone(&store);
            let code = code.to_string();
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                let price = Decimal::new(1000 + (step as i64 * 10) + i as i64, 0);
                let when = at(1, 1) + chrono::Duration::days(step as i64);
                store.record_price(&code, Some(price), when).await
            }));
        }
    }
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => {}
            Err(StoreError::OutOfOrderObservation { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(rejected < 30);

    for code in codes {
        let history = store.price_history(code).await.unwrap();
        assert!(!history.is_empty());
        assert_eq!(history.iter().filter(|r| r.is_open()).count(), 1);
        for pair in history.windows(2) {
            assert_eq!(pair[0].effective_to, Some(pair[1].effective_from));
        }
    }
}

#[tokio::test]
async fn test_inventory_snapshot_tracks_last_observation() {
    let store = MemoryStore::new();
    store.ensure_product("W001", None).await.unwrap();

    for n in 1..=5i64 {
        store
            .record_inventory(&InventoryObservation {
                code: "W001".into(),
                stock_total: Decimal::new(20 + n, 0),
                reserved: Decimal::new(n, 0),
                stock_free: Decimal::new(20, 0),
                as_of: at(1, n as u32),
            })
            .await
            .unwrap();
    }

    assert_eq!(store.history("W001").await.unwrap().len(), 5);
    let snapshot = store.snapshot("W001").await.unwrap().unwrap();
    assert_eq!(snapshot.stock_total, Decimal::new(25, 0));
    assert_eq!(snapshot.reserved, Decimal::new(5, 0));
    assert_eq!(snapshot.as_of_date, at(1, 5).date_naive());
}

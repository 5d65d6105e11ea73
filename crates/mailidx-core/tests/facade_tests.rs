//! Facade lifecycle tests against the in-memory engine

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use mailidx_core::{
    DbConfig, DbFacade, ErrorKind, InMemoryEngine, Key, DB_VERSION, ELEMENT_DATA_OS, GROUP_DATA_OS,
    META_DATA_OS, SEARCH_INDEX_META_OS, SEARCH_INDEX_OS,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn fast_config() -> DbConfig {
    DbConfig {
        delete_retry_delay_ms: 5,
        ..DbConfig::default()
    }
}

fn facade(engine: &InMemoryEngine) -> DbFacade<InMemoryEngine> {
    mailidx_core::logging::init_with_filter("mailidx_core=debug");
    DbFacade::with_config(engine.clone(), fast_config(), || {})
}

#[tokio::test]
async fn test_open_put_get_roundtrip() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);
    db.open("db1").await.unwrap();

    let tx = db.create_transaction(false, &[ELEMENT_DATA_OS]).await.unwrap();
    tx.put(ELEMENT_DATA_OS, Some("k1".into()), &json!({"a": 1}))
        .await
        .unwrap();
    tx.wait().await.unwrap();

    let tx = db.create_transaction(true, &[ELEMENT_DATA_OS]).await.unwrap();
    let value: Option<Value> = tx.get(ELEMENT_DATA_OS, "k1", None).await.unwrap();
    assert_eq!(value, Some(json!({"a": 1})));
    tx.wait().await.unwrap();
}

#[tokio::test]
async fn test_fresh_open_creates_every_store() {
    let engine = InMemoryEngine::new();
    let upgrades = Rc::new(Cell::new(0));
    let counter = upgrades.clone();
    let db = DbFacade::new(engine.clone(), move || counter.set(counter.get() + 1));

    db.open("db1").await.unwrap();

    assert!(db.is_open());
    assert_eq!(engine.stored_version("db1"), Some(DB_VERSION));
    assert_eq!(
        engine.store_names("db1"),
        vec![
            ELEMENT_DATA_OS.to_string(),
            GROUP_DATA_OS.to_string(),
            META_DATA_OS.to_string(),
            SEARCH_INDEX_OS.to_string(),
            SEARCH_INDEX_META_OS.to_string(),
            mailidx_core::SEARCH_TERM_SUGGESTIONS_OS.to_string(),
        ]
    );
    assert_eq!(upgrades.get(), 0, "fresh database must not trigger on_upgrade");
}

#[tokio::test]
async fn test_open_twice_keeps_connection() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);

    db.open("db1").await.unwrap();
    db.open("db1").await.unwrap();

    assert_eq!(engine.open_connections("db1"), 1);
    assert_eq!(db.database_id().as_deref(), Some("db1"));
}

#[tokio::test]
async fn test_version_upgrade_wipes_data_and_notifies_once() {
    let engine = InMemoryEngine::new();
    let old = DbFacade::with_config(
        engine.clone(),
        DbConfig {
            version: 2,
            ..fast_config()
        },
        || {},
    );
    old.open("db1").await.unwrap();
    let tx = old.create_transaction(false, &[META_DATA_OS]).await.unwrap();
    tx.put(META_DATA_OS, Some("lastIndexed".into()), &42)
        .await
        .unwrap();
    tx.wait().await.unwrap();
    assert_eq!(engine.record_count("db1", META_DATA_OS), 1);

    let upgrades = Rc::new(Cell::new(0));
    let counter = upgrades.clone();
    let watched = engine.clone();
    let db = DbFacade::with_config(engine.clone(), fast_config(), move || {
        // Runs before the old stores are deleted.
        assert_eq!(watched.record_count("db1", META_DATA_OS), 1);
        counter.set(counter.get() + 1)
    });
    db.open("db1").await.unwrap();

    assert_eq!(upgrades.get(), 1);
    assert_eq!(engine.stored_version("db1"), Some(DB_VERSION));
    assert_eq!(engine.record_count("db1", META_DATA_OS), 0);
    // The older connection was told to go away.
    assert!(!old.is_open());
}

#[tokio::test]
async fn test_transaction_open_across_upgrade_lands_before_wipe() {
    let engine = InMemoryEngine::new();
    let old = DbFacade::with_config(
        engine.clone(),
        DbConfig {
            version: 2,
            ..fast_config()
        },
        || {},
    );
    old.open("db1").await.unwrap();
    let stale = old.create_transaction(false, &[META_DATA_OS]).await.unwrap();
    stale
        .put(META_DATA_OS, Some("stale".into()), &1)
        .await
        .unwrap();

    let db = facade(&engine);
    db.open("db1").await.unwrap();

    // The old transaction finished before the upgrade ran.
    assert_eq!(old.active_transactions(), 0);
    stale.wait().await.unwrap();
    let err = stale
        .put(META_DATA_OS, Some("later".into()), &2)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Request);

    let tx = db.create_transaction(true, &[META_DATA_OS]).await.unwrap();
    let value: Option<Value> = tx.get(META_DATA_OS, "stale", None).await.unwrap();
    assert_eq!(value, None);
    assert_eq!(tx.count(META_DATA_OS).await.unwrap(), 0);
    tx.wait().await.unwrap();
    assert_eq!(engine.record_count("db1", META_DATA_OS), 0);
}

#[tokio::test]
async fn test_delete_database_without_active_transactions() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);
    db.open("db1").await.unwrap();

    let tx = db.create_transaction(false, &[GROUP_DATA_OS]).await.unwrap();
    tx.put(GROUP_DATA_OS, Some(Key::Int(7)), &json!({"index": 3}))
        .await
        .unwrap();
    tx.wait().await.unwrap();

    db.delete_database().await.unwrap();
    assert!(!db.is_open());
    assert!(engine.database_names().is_empty());

    // Next use reopens a fresh, empty database.
    let tx = db.create_transaction(true, &[GROUP_DATA_OS]).await.unwrap();
    let value: Option<Value> = tx.get(GROUP_DATA_OS, Key::Int(7), None).await.unwrap();
    assert_eq!(value, None);
    assert_eq!(tx.count(GROUP_DATA_OS).await.unwrap(), 0);
    assert!(db.is_open());
}

#[tokio::test]
async fn test_delete_database_before_open_is_noop() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);

    db.delete_database().await.unwrap();
    assert!(engine.database_names().is_empty());
}

#[tokio::test]
async fn test_delete_database_waits_for_active_transaction() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);
    db.open("db1").await.unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let tx = db.create_transaction(false, &[ELEMENT_DATA_OS]).await.unwrap();
    assert_eq!(db.active_transactions(), 1);

    let writer = async {
        tx.put(ELEMENT_DATA_OS, Some("k".into()), &"v").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tx.wait().await.unwrap();
        events.borrow_mut().push("committed");
    };
    let deleter = async {
        db.delete_database().await.unwrap();
        events.borrow_mut().push("deleted");
    };
    tokio::join!(writer, deleter);

    assert_eq!(*events.borrow(), vec!["committed", "deleted"]);
    assert_eq!(db.active_transactions(), 0);
    assert!(engine.database_names().is_empty());
}

#[tokio::test]
async fn test_delete_database_gives_up_after_max_retries() {
    let engine = InMemoryEngine::new();
    let db = DbFacade::with_config(
        engine.clone(),
        DbConfig {
            delete_retry_delay_ms: 1,
            delete_max_retries: Some(3),
            ..DbConfig::default()
        },
        || {},
    );
    db.open("db1").await.unwrap();

    let _tx = db.create_transaction(true, &[META_DATA_OS]).await.unwrap();
    let err = db.delete_database().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(engine.database_names(), vec!["db1".to_string()]);
    assert!(db.is_open());
}

#[tokio::test]
async fn test_active_count_released_exactly_once() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);
    db.open("db1").await.unwrap();

    let committed = db.create_transaction(false, &[META_DATA_OS]).await.unwrap();
    let aborted = db.create_transaction(false, &[META_DATA_OS]).await.unwrap();
    let dropped = db.create_transaction(true, &[META_DATA_OS]).await.unwrap();
    assert_eq!(db.active_transactions(), 3);

    committed.wait().await.unwrap();
    committed.wait().await.unwrap();
    assert_eq!(db.active_transactions(), 2);

    aborted.abort().unwrap();
    aborted.wait().await.unwrap();
    assert_eq!(db.active_transactions(), 1);

    drop(committed);
    drop(aborted);
    assert_eq!(db.active_transactions(), 1);

    drop(dropped);
    assert_eq!(db.active_transactions(), 0);
}

#[tokio::test]
async fn test_create_transaction_before_open_fails() {
    let db = facade(&InMemoryEngine::new());

    let err = db
        .create_transaction(true, &[META_DATA_OS])
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::NotOpened);
}

#[tokio::test]
async fn test_open_without_engine_reports_not_available() {
    let engine = InMemoryEngine::new();
    engine.set_available(false);
    let db = facade(&engine);

    let err = db.open("db1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAvailable);

    // The failure is cached until the connection is reset.
    engine.clear_faults();
    let err = db.open("db1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAvailable);

    db.close();
    db.open("db1").await.unwrap();
    assert!(db.is_open());
}

#[tokio::test]
async fn test_failed_store_creation_is_upgrade_error() {
    let engine = InMemoryEngine::new();
    engine.fail_store_creation(GROUP_DATA_OS);
    let db = facade(&engine);

    let err = db.open("db1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Upgrade);
    assert_eq!(err.store(), Some(GROUP_DATA_OS));
    assert!(engine.database_names().is_empty());
}

#[tokio::test]
async fn test_unknown_store_is_transaction_error() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);
    db.open("db1").await.unwrap();

    let err = db
        .create_transaction(true, &[META_DATA_OS, "Attachments"])
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Transaction);
    assert_eq!(err.store(), Some("Attachments"));
    assert_eq!(db.active_transactions(), 0);
}

#[tokio::test]
async fn test_engine_close_triggers_reopen() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);
    db.open("db1").await.unwrap();

    engine.close_connections("db1");
    assert!(!db.is_open());

    let tx = db.create_transaction(true, &[META_DATA_OS]).await.unwrap();
    tx.wait().await.unwrap();
    assert!(db.is_open());
    assert_eq!(engine.open_connections("db1"), 1);
}

#[tokio::test]
async fn test_close_then_reuse() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);
    db.open("db1").await.unwrap();

    db.close();
    assert!(!db.is_open());
    assert_eq!(engine.open_connections("db1"), 0);

    let tx = db.create_transaction(false, &[META_DATA_OS]).await.unwrap();
    tx.put(META_DATA_OS, Some("x".into()), &1).await.unwrap();
    tx.wait().await.unwrap();
    assert_eq!(engine.record_count("db1", META_DATA_OS), 1);
}

#[tokio::test]
async fn test_clones_share_connection_and_counter() {
    let engine = InMemoryEngine::new();
    let db = facade(&engine);
    let other = db.clone();
    db.open("db1").await.unwrap();

    assert!(other.is_open());
    let _tx = other.create_transaction(true, &[META_DATA_OS]).await.unwrap();
    assert_eq!(db.active_transactions(), 1);
}

//! Store-wide clear and recovery from closing connections.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stash_test_utils::assertions::*;
use stash_test_utils::fixtures::*;
use stash_test_utils::*;

#[tokio::test]
async fn test_clear_wipes_store_and_notifies() {
    init_test_tracing();
    let (factory, kv) = memory_kv();
    let recorder = RecordingListener::new();
    kv.set("a:1", &1).await.unwrap();
    kv.set("a:2", &json!({"x": true})).await.unwrap();
    kv.set("b:1", &3).await.unwrap();
    kv.add_listener("a:", recorder.callback(), None);

    kv.clear().await.unwrap();

    assert!(kv.list().await.unwrap().is_empty());
    assert_eq!(kv.connection().state(), ConnectionState::Ready);
    assert_eq!(factory.open_count(), 2);

    assert_changes(&recorder, &[("a:1", KvOp::Del), ("a:2", KvOp::Del)]);
    assert_eq!(recorder.changes()[1].old_value, Some(json!({"x": true})));
}

#[tokio::test]
async fn test_clear_on_unopened_store() {
    let (factory, kv) = memory_kv();

    kv.clear().await.unwrap();

    assert_eq!(factory.open_count(), 2);
    kv.set("k", &1).await.unwrap();
    assert_eq!(kv.get::<i32>("k").await, Ok(Some(1)));
}

#[tokio::test]
async fn test_operations_wait_for_clear() {
    let config = fast_config().with_clear_pause(Duration::from_millis(50));
    let (_, kv) = memory_kv_with(config);
    kv.set("old", &1).await.unwrap();

    let clearing = tokio::spawn({
        let kv = Arc::clone(&kv);
        async move { kv.clear().await }
    });
    while kv.connection().state() != ConnectionState::Resetting {
        tokio::task::yield_now().await;
    }

    // Issued while the store is being reset; must land in the fresh store.
    kv.set("new", &2).await.unwrap();
    clearing.await.expect("clear task").unwrap();

    assert_eq!(kv.list().await.unwrap(), vec!["new"]);
}

#[tokio::test]
async fn test_clear_failure_keeps_store_usable() {
    let (factory, kv) = memory_kv();
    kv.set("k", &1).await.unwrap();
    factory.fail_next(StoreOp::Destroy, StoreError::fatal("locked"));

    assert_store_error(&kv.clear().await, |e| matches!(e, StoreError::Fatal { .. }));

    assert_eq!(kv.connection().state(), ConnectionState::Ready);
    assert_ok(&kv.set("k2", &2).await);
}

#[tokio::test]
async fn test_closing_connection_is_reopened() {
    let (factory, kv) = memory_kv();
    kv.set("k", &"v").await.unwrap();
    factory.fail_next(StoreOp::Get, StoreError::closing("database is closing"));

    assert_eq!(kv.get::<String>("k").await, Ok(Some("v".to_string())));
    assert_eq!(factory.open_count(), 2);
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    let (factory, kv) = memory_kv_with(fast_config().with_max_attempts(2));
    for _ in 0..2 {
        factory.fail_next(StoreOp::AllDocs, StoreError::closing("database is closing"));
    }

    assert_store_error(&kv.list().await, StoreError::is_transient);
}

#[tokio::test]
async fn test_concurrent_first_use_opens_once() {
    let factory = InMemoryStoreFactory::new().with_open_delay(Duration::from_millis(20));
    let kv = Arc::new(KvStore::new(factory.clone(), fast_config()).unwrap());

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let kv = Arc::clone(&kv);
            tokio::spawn(async move { kv.set(&format!("k{}", i), &i).await })
        })
        .collect();
    for task in tasks {
        task.await.expect("set task").unwrap();
    }

    assert_eq!(factory.open_count(), 1);
    assert_eq!(kv.list().await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_wait_timeout_bounds_acquire() {
    let factory = InMemoryStoreFactory::new().with_open_delay(Duration::from_millis(200));
    let config = fast_config().with_connection_wait_timeout(Duration::from_millis(20));
    let kv = KvStore::new(factory, config).unwrap();

    assert_store_error(&kv.exists("k").await, |e| matches!(e, StoreError::Fatal { .. }));
}

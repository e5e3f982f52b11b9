//! Stash Test Utilities
//!
//! Shared test infrastructure for the stash workspace:
//! - Proptest generators for keys and JSON values
//! - Fixtures for in-memory key-value stores with fast timings
//! - A listener that records every change it receives
//! - Assertions on stash results

use std::sync::{Arc, Mutex, PoisonError};

// Re-export the types tests reach for most
pub use stash_core::{
    KvChange, KvOp, StashConfig, StashError, StashResult, StoreError, StoredDocument,
};
pub use stash_storage::{
    listener, CacheEntry, ConnectionState, ForceRefresh, InMemoryStoreFactory, KvStore,
    ListenerFn, LmdbStoreFactory, StoreOp, TtlCache,
};

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; defaults to `debug` for stash crates. Safe to call from
/// every test.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stash_storage=debug,stash_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// RECORDING LISTENER
// ============================================================================

/// Listener that keeps every change it is handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    changes: Arc<Mutex<Vec<KvChange>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback handle feeding this recorder. Every call returns a new
    /// handle, so registering two of them registers two listeners.
    pub fn callback(&self) -> ListenerFn {
        let changes = Arc::clone(&self.changes);
        listener(move |change| {
            changes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(change.clone());
        })
    }

    pub fn changes(&self) -> Vec<KvChange> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Keys of the recorded changes, in delivery order.
    pub fn keys(&self) -> Vec<String> {
        self.changes().into_iter().map(|c| c.key).collect()
    }

    pub fn len(&self) -> usize {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and values.

    use proptest::prelude::*;
    use serde_json::{Map, Number, Value};

    /// Generate a non-empty key, optionally namespaced with a `prefix:`.
    pub fn arb_key() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z][a-z0-9_]{0,15}",
            "[a-z]{1,6}:[a-z0-9]{1,10}",
        ]
    }

    /// Generate a JSON scalar other than `null`. Numbers are integers so that
    /// values compare equal after a trip through JSON text.
    pub fn arb_json_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| Value::Number(Number::from(n))),
            ".{0,32}".prop_map(Value::String),
        ]
    }

    /// Generate a JSON value (never `null`, which reads back as absent).
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        arb_json_scalar().prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-zA-Z_]{1,8}", inner, 0..6)
                    .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>())),
            ]
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built stores and configs.

    use super::*;
    use std::time::Duration;

    /// Config with millisecond retry backoff and clear pause.
    pub fn fast_config() -> StashConfig {
        StashConfig::new()
            .with_store_name("stash-test")
            .with_retry_backoff(Duration::from_millis(5))
            .with_clear_pause(Duration::from_millis(5))
    }

    /// An in-memory store using [`fast_config`], and the factory behind it
    /// for fault injection.
    pub fn memory_kv() -> (InMemoryStoreFactory, Arc<KvStore<InMemoryStoreFactory>>) {
        memory_kv_with(fast_config())
    }

    pub fn memory_kv_with(
        config: StashConfig,
    ) -> (InMemoryStoreFactory, Arc<KvStore<InMemoryStoreFactory>>) {
        let factory = InMemoryStoreFactory::new();
        let kv = match KvStore::new(factory.clone(), config) {
            Ok(kv) => kv,
            Err(e) => panic!("invalid test config: {}", e),
        };
        (factory, Arc::new(kv))
    }

    /// An LMDB-backed store rooted at `root`.
    pub fn lmdb_kv(root: &std::path::Path) -> Arc<KvStore<LmdbStoreFactory>> {
        match KvStore::new(LmdbStoreFactory::new(root, 16), fast_config()) {
            Ok(kv) => Arc::new(kv),
            Err(e) => panic!("invalid test config: {}", e),
        }
    }

    /// A TTL cache over a fresh in-memory store.
    pub fn memory_cache() -> (InMemoryStoreFactory, TtlCache<InMemoryStoreFactory>) {
        let config = fast_config();
        let ttl = config.default_cache_ttl;
        let (factory, kv) = memory_kv_with(config);
        (factory, TtlCache::new(kv, ttl))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on stash results.

    use super::*;

    /// Assert that a StashResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &StashResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a StashResult is a store error for which `matches` holds.
    #[track_caller]
    pub fn assert_store_error<T: std::fmt::Debug>(
        result: &StashResult<T>,
        matches: impl Fn(&StoreError) -> bool,
    ) {
        match result {
            Err(StashError::Store(e)) if matches(e) => {}
            other => panic!("Expected matching store error, got: {:?}", other),
        }
    }

    /// Assert that the recorder saw exactly these `(key, op)` pairs in order.
    #[track_caller]
    pub fn assert_changes(recorder: &RecordingListener, expected: &[(&str, KvOp)]) {
        let seen: Vec<(String, KvOp)> = recorder
            .changes()
            .into_iter()
            .map(|c| (c.key, c.op))
            .collect();
        let expected: Vec<(String, KvOp)> = expected
            .iter()
            .map(|(key, op)| (key.to_string(), *op))
            .collect();
        assert_eq!(seen, expected);
    }
}

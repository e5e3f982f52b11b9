//! Key-value operations over a managed document store.
//!
//! Values are serialized to JSON and kept in the `val` field of one document
//! per key. Writes use the document's revision for optimistic concurrency;
//! a write that loses the race is dropped, not retried or merged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use stash_core::{CodecError, KvChange, StashConfig, StashResult, StoreError, StoredDocument};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::listeners::{ListenerFn, ListenerRegistry};
use crate::retry::RetryPolicy;
use crate::store::{DocumentStore, StoreFactory};

/// Key-value store with change listeners.
///
/// Owns its connection manager and listener registry; share it behind an
/// `Arc` to use it from several tasks.
///
/// # Example
///
/// ```ignore
/// let kv = KvStore::new(InMemoryStoreFactory::new(), StashConfig::default())?;
///
/// kv.add_listener("user:", listener(|change| println!("{:?}", change)), None);
/// kv.set("user:1", &json!({"name": "ada"})).await?;
/// let user: Option<Value> = kv.get("user:1").await?;
/// ```
pub struct KvStore<F: StoreFactory> {
    connection: ConnectionManager<F>,
    listeners: ListenerRegistry,
    retry: RetryPolicy,
    clear_pause: Duration,
}

impl<F: StoreFactory> fmt::Debug for KvStore<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvStore")
            .field("connection", &self.connection)
            .field("listeners", &self.listeners)
            .field("retry", &self.retry)
            .field("clear_pause", &self.clear_pause)
            .finish()
    }
}

impl<F: StoreFactory> KvStore<F> {
    /// Create a store over `factory`. The connection is opened lazily.
    pub fn new(factory: F, config: StashConfig) -> StashResult<Self> {
        config.validate()?;

        Ok(Self {
            connection: ConnectionManager::new(factory, config.store_name.clone())
                .with_wait_timeout(config.connection_wait_timeout),
            listeners: ListenerRegistry::new(config.slow_listener_threshold),
            retry: RetryPolicy::from_config(&config),
            clear_pause: config.clear_pause,
        })
    }

    pub fn connection(&self) -> &ConnectionManager<F> {
        &self.connection
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Store `value` under `key`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StashResult<()> {
        let value = serde_json::to_value(value).map_err(|e| CodecError::Serialize {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set_value(key, value).await
    }

    /// Store a JSON value under `key` and notify listeners.
    ///
    /// If another writer updates the document between our read and our
    /// write, this write is dropped with a warning and listeners are not
    /// notified.
    pub async fn set_value(&self, key: &str, value: Value) -> StashResult<()> {
        debug!(key, "KvSet");
        let marshaled = serde_json::to_string(&value).map_err(|e| CodecError::Serialize {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let marshaled = marshaled.as_str();

        let result = self
            .retry
            .run(&self.connection, "set", |conn| async move {
                let previous = match conn.get(key).await {
                    Ok(doc) => Some(doc),
                    Err(StoreError::NotFound { .. }) => None,
                    Err(e) => return Err(e),
                };
                let old_value = previous.as_ref().and_then(decode_old_value);

                conn.put(
                    StoredDocument::new(key, marshaled)
                        .with_rev(previous.and_then(|doc| doc.rev)),
                )
                .await?;
                Ok(old_value)
            })
            .await;

        let old_value = match result {
            Ok(old_value) => old_value,
            Err(StoreError::Conflict { .. }) => {
                warn!(key, "conflict detected, write dropped");
                return Ok(());
            }
            Err(e) => {
                warn!(key, error = %e, "KvSet failed");
                return Err(e.into());
            }
        };

        self.listeners.notify(&KvChange::set(key, old_value, value));
        Ok(())
    }

    /// Read the value under `key`, `None` if absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StashResult<Option<T>> {
        match self.get_value(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| {
                    CodecError::Deserialize {
                        key: key.to_string(),
                        reason: e.to_string(),
                    }
                    .into()
                }),
            None => Ok(None),
        }
    }

    /// Read the JSON value under `key`.
    ///
    /// Absent keys and keys holding JSON `null` both read as `None`.
    pub async fn get_value(&self, key: &str) -> StashResult<Option<Value>> {
        debug!(key, "KvGet");
        let doc = self
            .retry
            .run(&self.connection, "get", |conn| async move {
                match conn.get(key).await {
                    Ok(doc) => Ok(Some(doc)),
                    Err(StoreError::NotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;

        match doc {
            Some(doc) => match decode(&doc)? {
                Value::Null => Ok(None),
                value => Ok(Some(value)),
            },
            None => Ok(None),
        }
    }

    /// Whether a document exists under `key`.
    pub async fn exists(&self, key: &str) -> StashResult<bool> {
        debug!(key, "KvExists");
        let exists = self
            .retry
            .run(&self.connection, "exists", |conn| async move {
                match conn.get(key).await {
                    Ok(_) => Ok(true),
                    Err(StoreError::NotFound { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(exists)
    }

    /// Move the value under `old_key` to `new_key`.
    ///
    /// Not atomic: this is a set followed by a delete, so a failure in
    /// between leaves the value under both keys. Does nothing when
    /// `old_key` holds no value.
    pub async fn rename(&self, old_key: &str, new_key: &str) -> StashResult<()> {
        debug!(old_key, new_key, "KvRename");
        let Some(value) = self.get_value(old_key).await? else {
            return Ok(());
        };

        self.set_value(new_key, value).await?;
        self.delete(old_key).await
    }

    /// Remove `key` and notify listeners. Absent keys are a no-op.
    pub async fn delete(&self, key: &str) -> StashResult<()> {
        debug!(key, "KvDel");
        let result = self
            .retry
            .run(&self.connection, "delete", |conn| async move {
                let doc = match conn.get(key).await {
                    Ok(doc) => doc,
                    Err(StoreError::NotFound { .. }) => return Ok(None),
                    Err(e) => return Err(e),
                };
                let old_value = decode_old_value(&doc);

                match conn.remove(&doc).await {
                    Ok(()) => Ok(Some(old_value)),
                    Err(StoreError::NotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await;

        match result {
            Ok(Some(old_value)) => {
                self.listeners.notify(&KvChange::del(key, old_value));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(StoreError::Conflict { .. }) => {
                warn!(key, "conflict detected, delete dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every key in the store, in the store's enumeration order.
    pub async fn list(&self) -> StashResult<Vec<String>> {
        debug!("KvList");
        let docs = self
            .retry
            .run(&self.connection, "list", |conn| async move { conn.all_docs().await })
            .await?;
        Ok(docs.into_iter().map(|doc| doc.id).collect())
    }

    /// Wipe the store.
    ///
    /// Takes the connection out of service, reports a delete for every key to
    /// the matching listeners, destroys the store, pauses, and opens a fresh
    /// empty store. Operations issued meanwhile wait until the fresh store is
    /// ready. The connection is put back in service on every exit path,
    /// including a failed destroy or reopen.
    pub async fn clear(&self) -> StashResult<()> {
        debug!("KvClear");
        let guard = self.connection.begin_reset().await?;
        let conn = Arc::clone(guard.connection());

        match conn.all_docs().await {
            Ok(docs) => {
                for doc in docs {
                    self.notify_cleared(conn.as_ref(), &doc.id).await;
                }
            }
            Err(e) => warn!(error = %e, "failed to enumerate keys before clear"),
        }

        let destroyed = conn.destroy().await;
        if let Err(e) = &destroyed {
            warn!(error = %e, "failed to destroy store");
        }
        drop(conn);

        sleep(self.clear_pause).await;
        guard.reopen().await?;
        destroyed?;
        Ok(())
    }

    async fn notify_cleared(&self, conn: &F::Store, key: &str) {
        let old_value = match conn.get(key).await {
            Ok(doc) => decode_old_value(&doc),
            Err(e) => {
                warn!(key, error = %e, "failed to notify listeners for cleared key");
                return;
            }
        };
        self.listeners.notify(&KvChange::del(key, old_value));
    }

    /// Register `callback` for mutations of keys starting with `prefix`.
    ///
    /// A named listener replaces an earlier one with the same name under the
    /// same prefix.
    pub fn add_listener(&self, prefix: &str, callback: ListenerFn, name: Option<&str>) {
        self.listeners.add(prefix, callback, name);
    }

    /// Remove the listener called `name` under `prefix`.
    pub fn remove_listener(&self, prefix: &str, name: &str) -> bool {
        self.listeners.remove(prefix, name)
    }
}

fn decode(doc: &StoredDocument) -> Result<Value, CodecError> {
    serde_json::from_str(&doc.val).map_err(|e| CodecError::Deserialize {
        key: doc.id.clone(),
        reason: e.to_string(),
    })
}

/// Previous value as reported to listeners. An unreadable payload is
/// reported as absent rather than blocking the write that replaces it.
fn decode_old_value(doc: &StoredDocument) -> Option<Value> {
    match decode(doc) {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %doc.id, error = %e, "unreadable previous value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::listeners::listener;
    use crate::memory::{InMemoryDocumentStore, InMemoryStoreFactory};
    use crate::store::StoreOp;
    use async_trait::async_trait;
    use serde_json::json;
    use stash_core::{KvOp, Revision, StashError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory stores where another writer updates the document between
    /// our read and the first update we write.
    #[derive(Clone, Default)]
    struct InterleavingFactory {
        inner: InMemoryStoreFactory,
    }

    struct InterleavingStore {
        inner: Arc<InMemoryDocumentStore>,
        raced: AtomicBool,
    }

    #[async_trait]
    impl StoreFactory for InterleavingFactory {
        type Store = InterleavingStore;

        async fn open(&self, name: &str) -> Result<Arc<InterleavingStore>, StoreError> {
            Ok(Arc::new(InterleavingStore {
                inner: self.inner.open(name).await?,
                raced: AtomicBool::new(false),
            }))
        }
    }

    #[async_trait]
    impl DocumentStore for InterleavingStore {
        async fn get(&self, id: &str) -> Result<StoredDocument, StoreError> {
            self.inner.get(id).await
        }

        async fn put(&self, doc: StoredDocument) -> Result<Revision, StoreError> {
            if doc.rev.is_some() && !self.raced.swap(true, Ordering::SeqCst) {
                let current = self.inner.get(&doc.id).await?;
                self.inner
                    .put(StoredDocument::new(doc.id.clone(), "\"other\"").with_rev(current.rev))
                    .await?;
            }
            self.inner.put(doc).await
        }

        async fn remove(&self, doc: &StoredDocument) -> Result<(), StoreError> {
            self.inner.remove(doc).await
        }

        async fn all_docs(&self) -> Result<Vec<StoredDocument>, StoreError> {
            self.inner.all_docs().await
        }

        async fn destroy(&self) -> Result<(), StoreError> {
            self.inner.destroy().await
        }
    }

    fn config() -> StashConfig {
        StashConfig::new()
            .with_store_name("kv-test")
            .with_retry_backoff(Duration::from_millis(5))
            .with_clear_pause(Duration::from_millis(5))
    }

    fn store() -> (InMemoryStoreFactory, KvStore<InMemoryStoreFactory>) {
        let factory = InMemoryStoreFactory::new();
        let kv = KvStore::new(factory.clone(), config()).expect("config should be valid");
        (factory, kv)
    }

    fn recorder<F: StoreFactory>(kv: &KvStore<F>, prefix: &str) -> Arc<Mutex<Vec<KvChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        kv.add_listener(
            prefix,
            listener(move |change| sink.lock().unwrap().push(change.clone())),
            None,
        );
        seen
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = KvStore::new(InMemoryStoreFactory::new(), config().with_max_attempts(0));
        assert!(matches!(result, Err(StashError::Config(_))));
    }

    #[tokio::test]
    async fn test_set_get_typed() {
        let (_, kv) = store();
        kv.set("n", &42u32).await.unwrap();
        assert_eq!(kv.get::<u32>("n").await.unwrap(), Some(42));
        assert_eq!(kv.connection().state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_get_with_wrong_type_is_codec_error() {
        let (_, kv) = store();
        kv.set("s", "text").await.unwrap();
        let err = kv.get::<u32>("s").await.unwrap_err();
        assert!(matches!(err, StashError::Codec(CodecError::Deserialize { .. })));
    }

    #[tokio::test]
    async fn test_null_reads_as_none_but_exists() {
        let (_, kv) = store();
        kv.set_value("nothing", Value::Null).await.unwrap();
        assert_eq!(kv.get_value("nothing").await.unwrap(), None);
        assert!(kv.exists("nothing").await.unwrap());
    }

    #[tokio::test]
    async fn test_conflict_is_swallowed_without_notification() {
        let (factory, kv) = store();
        let seen = recorder(&kv, "");
        factory.fail_next(StoreOp::Put, StoreError::conflict("k"));

        kv.set("k", &1).await.expect("conflict must not surface");

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(kv.get_value("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_revision_drops_write() {
        let kv = KvStore::new(InterleavingFactory::default(), config()).unwrap();
        let seen = recorder(&kv, "k");
        kv.set("k", "before").await.unwrap();

        kv.set("k", "after").await.expect("a lost race must not surface");

        assert_eq!(kv.get::<String>("k").await.unwrap().as_deref(), Some("other"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].new_value, Some(json!("before")));
    }

    #[tokio::test]
    async fn test_fatal_error_propagates() {
        let (factory, kv) = store();
        factory.fail_next(StoreOp::Get, StoreError::fatal("disk gone"));

        let err = kv.get_value("k").await.unwrap_err();
        assert_eq!(err, StashError::Store(StoreError::fatal("disk gone")));
    }

    #[tokio::test]
    async fn test_delete_notifies_with_old_value() {
        let (_, kv) = store();
        let seen = recorder(&kv, "p");
        kv.set("p:1", &json!({"a": 1})).await.unwrap();
        kv.delete("p:1").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].op, KvOp::Del);
        assert_eq!(seen[1].old_value, Some(json!({"a": 1})));
        assert_eq!(seen[1].new_value, None);
    }

    #[tokio::test]
    async fn test_delete_missing_does_not_notify() {
        let (_, kv) = store();
        let seen = recorder(&kv, "");
        kv.delete("missing").await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_moves_value() {
        let (_, kv) = store();
        kv.set("old", &"v").await.unwrap();
        kv.rename("old", "new").await.unwrap();

        assert_eq!(kv.get::<String>("new").await.unwrap().as_deref(), Some("v"));
        assert!(!kv.exists("old").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_missing_is_noop() {
        let (_, kv) = store();
        kv.rename("missing", "new").await.unwrap();
        assert!(kv.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_notifies_every_key() {
        let (_, kv) = store();
        let seen = recorder(&kv, "a");
        kv.set("a:1", &1).await.unwrap();
        kv.set("a:2", &2).await.unwrap();
        kv.set("b:1", &3).await.unwrap();
        seen.lock().unwrap().clear();

        kv.clear().await.unwrap();

        let seen = seen.lock().unwrap();
        let deleted: Vec<(&str, Option<Value>)> = seen
            .iter()
            .map(|c| (c.key.as_str(), c.old_value.clone()))
            .collect();
        assert_eq!(
            deleted,
            vec![("a:1", Some(json!(1))), ("a:2", Some(json!(2)))]
        );
        assert!(seen.iter().all(|c| c.op == KvOp::Del));
    }

    #[tokio::test]
    async fn test_clear_skips_unreadable_key() {
        let (factory, kv) = store();
        let seen = recorder(&kv, "a");
        kv.set("a:1", &1).await.unwrap();
        kv.set("a:2", &2).await.unwrap();
        seen.lock().unwrap().clear();
        // Consumed by the read of a:1 while clearing.
        factory.fail_next(StoreOp::Get, StoreError::fatal("unreadable"));

        kv.clear().await.expect("a failed notification must not fail the clear");

        let keys: Vec<String> = seen.lock().unwrap().iter().map(|c| c.key.clone()).collect();
        assert_eq!(keys, vec!["a:2"]);
        assert!(kv.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_restores_service_after_destroy_failure() {
        let (factory, kv) = store();
        kv.set("k", &1).await.unwrap();
        factory.fail_next(StoreOp::Destroy, StoreError::fatal("busy"));

        assert!(kv.clear().await.is_err());

        assert_eq!(kv.connection().state(), ConnectionState::Ready);
        kv.set("k2", &2).await.unwrap();
        assert_eq!(kv.get::<i32>("k2").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_clear_restores_service_after_reopen_failure() {
        let (factory, kv) = store();
        kv.set("k", &1).await.unwrap();
        // First open already happened; the next one is the reopen.
        factory.fail_next(StoreOp::Open, StoreError::fatal("no disk"));

        assert!(kv.clear().await.is_err());

        assert_eq!(kv.connection().state(), ConnectionState::Uninitialized);
        assert!(kv.list().await.unwrap().is_empty());
    }
}

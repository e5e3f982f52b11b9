//! In-memory document store.
//!
//! Named databases live as long as the factory that created them, so a store
//! reopened under the same name sees the same documents until it is
//! destroyed. The factory also carries the hooks tests need to exercise the
//! failure paths of the key-value layer: injected faults, a slow open and an
//! open counter.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use stash_core::{Revision, StoreError, StoredDocument};

use crate::store::{check_revision, DocumentStore, StoreFactory, StoreOp};

type Documents = BTreeMap<String, StoredDocument>;

#[derive(Debug, Default)]
struct FactoryState {
    databases: RwLock<HashMap<String, Arc<RwLock<Documents>>>>,
    faults: Mutex<HashMap<StoreOp, VecDeque<StoreError>>>,
    opens: AtomicUsize,
}

impl FactoryState {
    fn take_fault(&self, op: StoreOp) -> Option<StoreError> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
    }
}

/// Factory for process-local document stores.
///
/// Clones share the same databases and fault queue.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStoreFactory {
    state: Arc<FactoryState>,
    open_delay: Option<Duration>,
}

impl InMemoryStoreFactory {
    /// Create a new factory with no databases.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `open` take at least `delay`.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Fail the next call to `op` with `error`.
    ///
    /// Calls queue up: injecting twice fails the next two calls.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.state
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Number of documents currently held under `name`.
    pub fn document_count(&self, name: &str) -> usize {
        self.state
            .databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|docs| docs.read().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StoreFactory for InMemoryStoreFactory {
    type Store = InMemoryDocumentStore;

    async fn open(&self, name: &str) -> Result<Arc<InMemoryDocumentStore>, StoreError> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(fault) = self.state.take_fault(StoreOp::Open) {
            return Err(fault);
        }

        let docs = {
            let mut databases = self
                .state
                .databases
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(databases.entry(name.to_string()).or_default())
        };
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(InMemoryDocumentStore {
            name: name.to_string(),
            docs,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Handle to one named in-memory database.
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    name: String,
    docs: Arc<RwLock<Documents>>,
    state: Arc<FactoryState>,
    closed: AtomicBool,
}

impl InMemoryDocumentStore {
    /// Name the store was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle has been destroyed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn begin(&self, op: StoreOp) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::closing(format!(
                "store {} has been destroyed",
                self.name
            )));
        }
        match self.state.take_fault(op) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, id: &str) -> Result<StoredDocument, StoreError> {
        self.begin(StoreOp::Get)?;
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn put(&self, doc: StoredDocument) -> Result<Revision, StoreError> {
        self.begin(StoreOp::Put)?;
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);

        let current = docs.get(&doc.id).and_then(|d| d.rev.clone());
        check_revision(&doc.id, current.as_ref(), doc.rev.as_ref())?;

        let rev = Revision::next(current.as_ref(), &doc.id, &doc.val);
        docs.insert(
            doc.id.clone(),
            StoredDocument {
                id: doc.id,
                rev: Some(rev.clone()),
                val: doc.val,
            },
        );
        Ok(rev)
    }

    async fn remove(&self, doc: &StoredDocument) -> Result<(), StoreError> {
        self.begin(StoreOp::Remove)?;
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);

        let current = docs
            .get(&doc.id)
            .ok_or_else(|| StoreError::not_found(&doc.id))?;
        check_revision(&doc.id, current.rev.as_ref(), doc.rev.as_ref())?;

        docs.remove(&doc.id);
        Ok(())
    }

    async fn all_docs(&self) -> Result<Vec<StoredDocument>, StoreError> {
        self.begin(StoreOp::AllDocs)?;
        Ok(self
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.begin(StoreOp::Destroy)?;
        self.closed.store(true, Ordering::SeqCst);
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let mut databases = self
            .state
            .databases
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if databases
            .get(&self.name)
            .is_some_and(|docs| Arc::ptr_eq(docs, &self.docs))
        {
            databases.remove(&self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(factory: &InMemoryStoreFactory) -> Arc<InMemoryDocumentStore> {
        factory.open("test").await.expect("open should succeed")
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let factory = InMemoryStoreFactory::new();
        let store = open(&factory).await;

        let rev = store
            .put(StoredDocument::new("a", "1"))
            .await
            .expect("put should succeed");
        let doc = store.get("a").await.expect("get should succeed");

        assert_eq!(doc.val, "1");
        assert_eq!(doc.rev, Some(rev));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let factory = InMemoryStoreFactory::new();
        let store = open(&factory).await;

        let err = store.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let factory = InMemoryStoreFactory::new();
        let store = open(&factory).await;

        let first = store.put(StoredDocument::new("a", "1")).await.unwrap();
        store
            .put(StoredDocument::new("a", "2").with_rev(Some(first.clone())))
            .await
            .expect("update at current revision should succeed");

        let err = store
            .put(StoredDocument::new("a", "3").with_rev(Some(first)))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Creating over an existing document without a revision also conflicts.
        let err = store.put(StoredDocument::new("a", "4")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_remove_requires_current_revision() {
        let factory = InMemoryStoreFactory::new();
        let store = open(&factory).await;

        store.put(StoredDocument::new("a", "1")).await.unwrap();
        let doc = store.get("a").await.unwrap();
        store.remove(&doc).await.expect("remove should succeed");

        let err = store.remove(&doc).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_all_docs_ordered_by_id() {
        let factory = InMemoryStoreFactory::new();
        let store = open(&factory).await;

        for id in ["c", "a", "b"] {
            store.put(StoredDocument::new(id, "0")).await.unwrap();
        }

        let ids: Vec<String> = store
            .all_docs()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_reopen_shares_documents() {
        let factory = InMemoryStoreFactory::new();
        open(&factory).await.put(StoredDocument::new("a", "1")).await.unwrap();

        let reopened = open(&factory).await;
        assert!(reopened.get("a").await.is_ok());
        assert_eq!(factory.open_count(), 2);
        assert_eq!(factory.document_count("test"), 1);
    }

    #[tokio::test]
    async fn test_destroy_wipes_and_closes_handle() {
        let factory = InMemoryStoreFactory::new();
        let store = open(&factory).await;
        store.put(StoredDocument::new("a", "1")).await.unwrap();

        store.destroy().await.expect("destroy should succeed");

        assert!(store.is_closed());
        assert!(store.get("a").await.unwrap_err().is_transient());

        let fresh = open(&factory).await;
        assert!(fresh.all_docs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_faults_fire_once_each() {
        let factory = InMemoryStoreFactory::new();
        let store = open(&factory).await;

        factory.fail_next(StoreOp::Get, StoreError::closing("injected"));
        factory.fail_next(StoreOp::Get, StoreError::fatal("injected"));

        assert!(store.get("a").await.unwrap_err().is_transient());
        assert!(matches!(
            store.get("a").await.unwrap_err(),
            StoreError::Fatal { .. }
        ));
        assert!(store.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_open_failure() {
        let factory = InMemoryStoreFactory::new();
        factory.fail_next(StoreOp::Open, StoreError::fatal("disk unavailable"));

        assert!(factory.open("test").await.is_err());
        assert_eq!(factory.open_count(), 0);
        assert!(factory.open("test").await.is_ok());
    }
}

//! Document store contract.
//!
//! The key-value layer never persists anything itself. It talks to a
//! document store through these two traits: a factory that opens a named
//! store, and the store handle it returns.

use std::sync::Arc;

use async_trait::async_trait;
use stash_core::{Revision, StoreError, StoredDocument};

/// A handle to an open document store.
///
/// Implementations must map every backend failure onto [`StoreError`]:
/// - `NotFound` when the id does not exist (`get`, `remove`)
/// - `Conflict` when the supplied revision is stale (`put`, `remove`)
/// - `ConnectionClosing` when the handle was torn down underneath the call
/// - `Fatal` for everything else
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by id.
    async fn get(&self, id: &str) -> Result<StoredDocument, StoreError>;

    /// Create or replace a document, returning its new revision.
    ///
    /// `doc.rev` must be `None` for a new document and the current revision
    /// for an existing one.
    async fn put(&self, doc: StoredDocument) -> Result<Revision, StoreError>;

    /// Remove a document at the given revision.
    async fn remove(&self, doc: &StoredDocument) -> Result<(), StoreError>;

    /// Every document in the store, ordered by id.
    async fn all_docs(&self) -> Result<Vec<StoredDocument>, StoreError>;

    /// Irreversibly wipe the store. The handle is unusable afterwards.
    async fn destroy(&self) -> Result<(), StoreError>;
}

/// Opens named document stores.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// The store handle type this factory produces.
    type Store: DocumentStore + 'static;

    /// Open (creating if needed) the store called `name`.
    async fn open(&self, name: &str) -> Result<Arc<Self::Store>, StoreError>;
}

/// Store operations, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Open,
    Get,
    Put,
    Remove,
    AllDocs,
    Destroy,
}

/// Decide the outcome of a write against the revision currently stored.
///
/// Shared by the bundled stores so they agree on conflict semantics.
pub(crate) fn check_revision(
    id: &str,
    current: Option<&Revision>,
    supplied: Option<&Revision>,
) -> Result<(), StoreError> {
    match (current, supplied) {
        (None, None) => Ok(()),
        (Some(current), Some(supplied)) if current == supplied => Ok(()),
        _ => Err(StoreError::conflict(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_revision() {
        let r1 = Revision::next(None, "k", "1");
        let r2 = Revision::next(Some(&r1), "k", "2");

        assert!(check_revision("k", None, None).is_ok());
        assert!(check_revision("k", Some(&r1), Some(&r1)).is_ok());
        assert!(check_revision("k", Some(&r2), Some(&r1))
            .unwrap_err()
            .is_conflict());
        assert!(check_revision("k", Some(&r1), None).unwrap_err().is_conflict());
        assert!(check_revision("k", None, Some(&r1)).unwrap_err().is_conflict());
    }
}

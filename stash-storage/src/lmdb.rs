//! Document store persisted in LMDB through heed.
//!
//! Every store name owns an environment directory under the factory root,
//! holding one unnamed database. Records are keyed by document id and hold
//! `{"rev": "<revision>", "val": "<serialized value>"}` as JSON.
//!
//! `put` and `remove` read the current revision and apply the change in the
//! same write transaction; LMDB serializes writers, so a stale revision is
//! always caught.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use serde::{Deserialize, Serialize};
use stash_core::{Revision, StoreError, StoredDocument};

use crate::store::{check_revision, DocumentStore, StoreFactory};

/// Failures inside the LMDB store. All of them reach callers as
/// [`StoreError::Fatal`].
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// The store directory, environment or database could not be set up.
    #[error("cannot open store at {}: {reason}", .path.display())]
    Open { path: PathBuf, reason: String },

    #[error("lmdb {op} failed: {reason}")]
    Txn { op: &'static str, reason: String },

    /// A record that is not a `{rev, val}` document or whose key is not UTF-8.
    #[error("unreadable record {id}: {reason}")]
    Record { id: String, reason: String },
}

impl From<LmdbStoreError> for StoreError {
    fn from(e: LmdbStoreError) -> Self {
        StoreError::fatal(e.to_string())
    }
}

fn txn_failed(op: &'static str) -> impl FnOnce(heed::Error) -> LmdbStoreError {
    move |e| LmdbStoreError::Txn {
        op,
        reason: e.to_string(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedDocument {
    rev: String,
    val: String,
}

impl PersistedDocument {
    fn decode(id: &str, bytes: &[u8]) -> Result<StoredDocument, LmdbStoreError> {
        let persisted: PersistedDocument =
            serde_json::from_slice(bytes).map_err(|e| LmdbStoreError::Record {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(StoredDocument {
            id: id.to_string(),
            rev: Some(Revision::from_raw(persisted.rev)),
            val: persisted.val,
        })
    }

    fn encode(id: &str, rev: &Revision, val: &str) -> Result<Vec<u8>, LmdbStoreError> {
        serde_json::to_vec(&PersistedDocument {
            rev: rev.as_str().to_string(),
            val: val.to_string(),
        })
        .map_err(|e| LmdbStoreError::Record {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Clone)]
struct OpenedEnv {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl OpenedEnv {
    fn create(path: &Path, max_size_mb: usize) -> Result<Self, String> {
        std::fs::create_dir_all(path).map_err(|e| e.to_string())?;

        // SAFETY: a factory maps each directory once and hands out clones of
        // that Env; roots must not be shared between live factories.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path)
        }
        .map_err(|e| e.to_string())?;

        let mut wtxn = env.write_txn().map_err(|e| e.to_string())?;
        let db = env
            .create_database(&mut wtxn, None)
            .map_err(|e| e.to_string())?;
        wtxn.commit().map_err(|e| e.to_string())?;

        Ok(Self { env, db })
    }
}

/// Opens LMDB document stores under one root directory.
///
/// # Example
///
/// ```ignore
/// use stash_storage::{KvStore, LmdbStoreFactory};
/// use stash_core::StashConfig;
///
/// let factory = LmdbStoreFactory::new("/var/lib/myapp/stash", 64);
/// let kv = KvStore::new(factory, StashConfig::default())?;
/// kv.set("greeting", &"hello").await?;
/// ```
pub struct LmdbStoreFactory {
    root: PathBuf,
    max_size_mb: usize,
    envs: Mutex<HashMap<String, OpenedEnv>>,
}

impl LmdbStoreFactory {
    /// Stores live in `root/<name>`, each capped at `max_size_mb` megabytes.
    pub fn new<P: AsRef<Path>>(root: P, max_size_mb: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_size_mb,
            envs: Mutex::new(HashMap::new()),
        }
    }

    /// Directory a store called `name` lives in.
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn env_for(&self, name: &str) -> Result<OpenedEnv, LmdbStoreError> {
        let mut envs = self.envs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(opened) = envs.get(name) {
            return Ok(opened.clone());
        }

        let path = self.store_path(name);
        let opened = OpenedEnv::create(&path, self.max_size_mb)
            .map_err(|reason| LmdbStoreError::Open { path, reason })?;
        envs.insert(name.to_string(), opened.clone());
        Ok(opened)
    }
}

#[async_trait]
impl StoreFactory for LmdbStoreFactory {
    type Store = LmdbDocumentStore;

    async fn open(&self, name: &str) -> Result<Arc<LmdbDocumentStore>, StoreError> {
        let OpenedEnv { env, db } = self.env_for(name)?;
        Ok(Arc::new(LmdbDocumentStore {
            name: name.to_string(),
            env,
            db,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Handle to one LMDB-backed store. Stops serving once destroyed.
pub struct LmdbDocumentStore {
    name: String,
    env: Env,
    db: Database<Bytes, Bytes>,
    closed: AtomicBool,
}

impl LmdbDocumentStore {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::closing(format!(
                "store {} has been destroyed",
                self.name
            )));
        }
        Ok(())
    }

    fn current(&self, txn: &RoTxn<'_>, id: &str) -> Result<Option<StoredDocument>, LmdbStoreError> {
        match self.db.get(txn, id.as_bytes()).map_err(txn_failed("read"))? {
            Some(bytes) => PersistedDocument::decode(id, bytes).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DocumentStore for LmdbDocumentStore {
    async fn get(&self, id: &str) -> Result<StoredDocument, StoreError> {
        self.ensure_open()?;
        let rtxn = self.env.read_txn().map_err(txn_failed("begin read"))?;
        self.current(&rtxn, id)?
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn put(&self, doc: StoredDocument) -> Result<Revision, StoreError> {
        self.ensure_open()?;
        let mut wtxn = self.env.write_txn().map_err(txn_failed("begin write"))?;

        let current = self.current(&wtxn, &doc.id)?.and_then(|d| d.rev);
        check_revision(&doc.id, current.as_ref(), doc.rev.as_ref())?;

        let rev = Revision::next(current.as_ref(), &doc.id, &doc.val);
        let bytes = PersistedDocument::encode(&doc.id, &rev, &doc.val)?;
        self.db
            .put(&mut wtxn, doc.id.as_bytes(), &bytes)
            .map_err(txn_failed("put"))?;
        wtxn.commit().map_err(txn_failed("commit"))?;

        Ok(rev)
    }

    async fn remove(&self, doc: &StoredDocument) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut wtxn = self.env.write_txn().map_err(txn_failed("begin write"))?;

        let current = self
            .current(&wtxn, &doc.id)?
            .ok_or_else(|| StoreError::not_found(&doc.id))?;
        check_revision(&doc.id, current.rev.as_ref(), doc.rev.as_ref())?;

        self.db
            .delete(&mut wtxn, doc.id.as_bytes())
            .map_err(txn_failed("delete"))?;
        wtxn.commit().map_err(txn_failed("commit"))?;

        Ok(())
    }

    async fn all_docs(&self) -> Result<Vec<StoredDocument>, StoreError> {
        self.ensure_open()?;
        let rtxn = self.env.read_txn().map_err(txn_failed("begin read"))?;

        let mut docs = Vec::new();
        for entry in self.db.iter(&rtxn).map_err(txn_failed("iterate"))? {
            let (key, bytes) = entry.map_err(txn_failed("iterate"))?;
            let id = std::str::from_utf8(key).map_err(|e| LmdbStoreError::Record {
                id: String::from_utf8_lossy(key).into_owned(),
                reason: e.to_string(),
            })?;
            docs.push(PersistedDocument::decode(id, bytes)?);
        }

        Ok(docs)
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed.store(true, Ordering::SeqCst);

        let mut wtxn = self.env.write_txn().map_err(txn_failed("begin write"))?;
        self.db.clear(&mut wtxn).map_err(txn_failed("clear"))?;
        wtxn.commit().map_err(txn_failed("commit"))?;

        Ok(())
    }
}

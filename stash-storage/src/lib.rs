//! Stash Storage - Key-Value Store over a Document Store
//!
//! Layers, top to bottom:
//!
//! - [`TtlCache`]: best-effort values with a time to live
//! - [`KvStore`]: set/get/delete/list/clear with prefix change listeners
//! - [`RetryPolicy`]: re-runs an operation whose connection closed under it
//! - [`ConnectionManager`]: one lazily opened connection per store name
//! - [`DocumentStore`] / [`StoreFactory`]: the document store itself, in
//!   memory ([`InMemoryStoreFactory`]) or on LMDB ([`LmdbStoreFactory`])

pub mod cache;
pub mod connection;
pub mod kv;
pub mod listeners;
pub mod lmdb;
pub mod memory;
pub mod retry;
pub mod store;

pub use cache::{CacheEntry, CacheStats, ForceRefresh, TtlCache};
pub use connection::{ConnectionManager, ConnectionState, ResetGuard};
pub use kv::KvStore;
pub use listeners::{listener, ListenerFn, ListenerRegistry};
pub use lmdb::{LmdbDocumentStore, LmdbStoreError, LmdbStoreFactory};
pub use memory::{InMemoryDocumentStore, InMemoryStoreFactory};
pub use retry::RetryPolicy;
pub use store::{DocumentStore, StoreFactory, StoreOp};

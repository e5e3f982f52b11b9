//! Stash Core - Data Types
//!
//! Documents, revisions, change notifications, the error taxonomy and the
//! configuration shared by every stash crate. No I/O lives here.

pub mod config;
pub mod document;
pub mod error;

pub use config::{StashConfig, DEFAULT_CACHE_TTL, DEFAULT_STORE_NAME};
pub use document::{KvChange, KvOp, Revision, StoredDocument};
pub use error::{CodecError, ConfigError, StashError, StashResult, StoreError};

//! Documents, revisions and change notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque revision token minted by a store on every successful write.
///
/// Formatted as `<generation>-<digest>`. Callers only ever hand a revision
/// back to the store that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Wrap a revision string read back from a store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mint the revision that follows `previous` for a write of `val` to `id`.
    pub fn next(previous: Option<&Revision>, id: &str, val: &str) -> Self {
        let generation = previous.map(Revision::generation).unwrap_or(0) + 1;

        let mut hasher = Sha256::new();
        if let Some(previous) = previous {
            hasher.update(previous.0.as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
        hasher.update(val.as_bytes());
        let digest = hex::encode(hasher.finalize());

        Self(format!("{}-{}", generation, &digest[..32]))
    }

    /// Number of writes this revision descends from, zero if unparseable.
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(generation, _)| generation.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document as held by the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Unique key.
    pub id: String,
    /// Revision the write is based on. `None` creates a new document.
    pub rev: Option<Revision>,
    /// Serialized value payload.
    pub val: String,
}

impl StoredDocument {
    /// A document that does not exist in the store yet.
    pub fn new(id: impl Into<String>, val: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            val: val.into(),
        }
    }

    /// A write that replaces the document at `rev`.
    pub fn with_rev(mut self, rev: Option<Revision>) -> Self {
        self.rev = rev;
        self
    }
}

/// Kind of mutation reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KvOp {
    Set = 1,
    Del = 2,
}

impl KvOp {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for KvOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvOp::Set => f.write_str("SET"),
            KvOp::Del => f.write_str("DEL"),
        }
    }
}

/// A completed mutation, as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvChange {
    pub key: String,
    pub op: KvOp,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl KvChange {
    pub fn set(key: impl Into<String>, old_value: Option<Value>, new_value: Value) -> Self {
        Self {
            key: key.into(),
            op: KvOp::Set,
            old_value,
            new_value: Some(new_value),
        }
    }

    pub fn del(key: impl Into<String>, old_value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            op: KvOp::Del,
            old_value,
            new_value: None,
        }
    }
}

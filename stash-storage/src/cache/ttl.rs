use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use stash_core::StashResult;
use tracing::{debug, error};

use super::entry::CacheEntry;
use crate::kv::KvStore;
use crate::store::StoreFactory;

/// Shared flag that makes every cache read a miss while it is set.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ForceRefresh(Arc<AtomicBool>);

impl ForceRefresh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters for cache reads and swallowed failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that returned a live value.
    pub hits: u64,
    /// Reads that found nothing, including expired entries.
    pub misses: u64,
    /// Expired entries found (and deleted) on read.
    pub expired: u64,
    /// Reads skipped because [`ForceRefresh`] was set.
    pub bypassed: u64,
    /// Reads or writes that failed and were swallowed.
    pub errors: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    bypassed: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Best-effort cache of values with a time to live.
pub struct TtlCache<F: StoreFactory> {
    kv: Arc<KvStore<F>>,
    force_refresh: ForceRefresh,
    default_ttl: Duration,
    counters: Counters,
}

impl<F: StoreFactory> fmt::Debug for TtlCache<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("kv", &self.kv)
            .field("force_refresh", &self.force_refresh)
            .field("default_ttl", &self.default_ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: StoreFactory> TtlCache<F> {
    pub fn new(kv: Arc<KvStore<F>>, default_ttl: Duration) -> Self {
        Self {
            kv,
            force_refresh: ForceRefresh::new(),
            default_ttl,
            counters: Counters::default(),
        }
    }

    /// Use `flag` as the bypass signal instead of a private one.
    pub fn with_force_refresh(mut self, flag: ForceRefresh) -> Self {
        self.force_refresh = flag;
        self
    }

    pub fn force_refresh(&self) -> &ForceRefresh {
        &self.force_refresh
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn kv(&self) -> &Arc<KvStore<F>> {
        &self.kv
    }

    /// Cache `value` under `key` for `ttl`. Failures are logged, not returned.
    pub async fn set_cache<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        if let Err(e) = self.try_set(key, value, ttl).await {
            Counters::bump(&self.counters.errors);
            error!(key, error = %e, "cache write failed");
        }
    }

    /// Cache `value` under `key` for the default TTL.
    pub async fn set_cache_default<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        self.set_cache(key, value, self.default_ttl).await;
    }

    /// The live cached value under `key`.
    ///
    /// `None` when the bypass flag is set, the key is absent, the entry has
    /// expired (it is deleted), or anything fails along the way.
    pub async fn get_cache<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if self.force_refresh.is_set() {
            Counters::bump(&self.counters.bypassed);
            debug!(key, "cache bypassed");
            return None;
        }

        match self.try_get(key).await {
            Ok(Some(value)) => {
                Counters::bump(&self.counters.hits);
                debug!(key, "cache hit");
                Some(value)
            }
            Ok(None) => {
                Counters::bump(&self.counters.misses);
                debug!(key, "cache miss");
                None
            }
            Err(e) => {
                Counters::bump(&self.counters.errors);
                error!(key, error = %e, "cache read failed");
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            bypassed: self.counters.bypassed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    async fn try_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> StashResult<()> {
        let entry = CacheEntry::new(value, ttl, Utc::now());
        self.kv.set(key, &entry).await
    }

    async fn try_get<T: DeserializeOwned>(&self, key: &str) -> StashResult<Option<T>> {
        let Some(entry) = self.kv.get::<CacheEntry<Value>>(key).await? else {
            return Ok(None);
        };

        if entry.is_expired_at(Utc::now()) {
            Counters::bump(&self.counters.expired);
            debug!(key, expire_at = entry.expire_at, "cache entry expired");
            self.kv.delete(key).await?;
            return Ok(None);
        }

        let value = serde_json::from_value(entry.val).map_err(|e| {
            stash_core::CodecError::Deserialize {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Some(value))
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached value and the instant it stops being valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub val: T,
    /// Expiry as milliseconds since the Unix epoch.
    #[serde(rename = "expireAt")]
    pub expire_at: i64,
}

impl<T> CacheEntry<T> {
    /// Wrap `val` so that it expires `ttl` after `now`.
    pub fn new(val: T, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            val,
            expire_at: now.timestamp_millis().saturating_add(ttl_ms),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.expire_at)
    }

    /// Whether the entry has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at < now.timestamp_millis()
    }
}

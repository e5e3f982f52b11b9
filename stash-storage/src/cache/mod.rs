//! TTL cache on top of the key-value store.
//!
//! Cached values are stored as ordinary documents shaped `{val, expireAt}`.
//! Expiry is checked on read; an expired entry is deleted when it is found.
//! Every cache failure is logged and treated as a miss, so a broken cache
//! never fails the caller.
//!
//! # Example
//!
//! ```ignore
//! let cache = TtlCache::new(Arc::clone(&kv), Duration::from_secs(60));
//!
//! cache.set_cache("weather:paris", &forecast, Duration::from_secs(600)).await;
//! if let Some(forecast) = cache.get_cache::<Forecast>("weather:paris").await {
//!     // fresh
//! }
//! ```

mod entry;
mod ttl;

pub use entry::CacheEntry;
pub use ttl::{CacheStats, ForceRefresh, TtlCache};

//! Configuration types

use crate::error::{ConfigError, StashResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the store opened when none is configured.
pub const DEFAULT_STORE_NAME: &str = "mydatabase";

/// One day, the default lifetime of a cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(86_400);

/// Master configuration for a key-value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StashConfig {
    /// Name passed to the store factory when opening the connection.
    pub store_name: String,
    /// Attempts per operation when the connection is closing underneath it.
    pub max_attempts: u32,
    /// Pause before reopening the connection on a retry.
    pub retry_backoff: Duration,
    /// Pause between destroying and reopening the store during a clear.
    pub clear_pause: Duration,
    /// Upper bound on waiting for the connection to become ready.
    /// `None` waits indefinitely.
    pub connection_wait_timeout: Option<Duration>,
    /// Listeners running longer than this are reported.
    pub slow_listener_threshold: Duration,
    /// TTL used by the cache layer when the caller gives none.
    pub default_cache_ttl: Duration,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            store_name: DEFAULT_STORE_NAME.to_string(),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(300),
            clear_pause: Duration::from_millis(500),
            connection_wait_timeout: None,
            slow_listener_threshold: Duration::from_millis(100),
            default_cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl StashConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store name.
    pub fn with_store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    /// Set the maximum number of attempts per operation.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the pause between destroy and reopen during a clear.
    pub fn with_clear_pause(mut self, pause: Duration) -> Self {
        self.clear_pause = pause;
        self
    }

    /// Bound the time spent waiting for the connection.
    pub fn with_connection_wait_timeout(mut self, timeout: Duration) -> Self {
        self.connection_wait_timeout = Some(timeout);
        self
    }

    /// Set the slow listener threshold.
    pub fn with_slow_listener_threshold(mut self, threshold: Duration) -> Self {
        self.slow_listener_threshold = threshold;
        self
    }

    /// Set the default cache TTL.
    pub fn with_default_cache_ttl(mut self, ttl: Duration) -> Self {
        self.default_cache_ttl = ttl;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `STASH_STORE_NAME`: Store name (default: mydatabase)
    /// - `STASH_MAX_ATTEMPTS`: Attempts per operation (default: 3)
    /// - `STASH_RETRY_BACKOFF_MS`: Retry backoff in ms (default: 300)
    /// - `STASH_CLEAR_PAUSE_MS`: Pause during clear in ms (default: 500)
    /// - `STASH_CONNECTION_WAIT_TIMEOUT_MS`: Connection wait bound in ms (default: unbounded)
    /// - `STASH_SLOW_LISTENER_MS`: Slow listener threshold in ms (default: 100)
    /// - `STASH_DEFAULT_CACHE_TTL_SECS`: Default cache TTL in seconds (default: 86400)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            store_name: std::env::var("STASH_STORE_NAME").unwrap_or(defaults.store_name),
            max_attempts: env_parse("STASH_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            retry_backoff: env_parse("STASH_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            clear_pause: env_parse("STASH_CLEAR_PAUSE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.clear_pause),
            connection_wait_timeout: env_parse("STASH_CONNECTION_WAIT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .or(defaults.connection_wait_timeout),
            slow_listener_threshold: env_parse("STASH_SLOW_LISTENER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.slow_listener_threshold),
            default_cache_ttl: env_parse("STASH_DEFAULT_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_cache_ttl),
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - store_name is not empty
    /// - max_attempts >= 1
    /// - default_cache_ttl is positive
    /// - connection_wait_timeout, when set, is positive
    pub fn validate(&self) -> StashResult<()> {
        if self.store_name.trim().is_empty() {
            return Err(invalid("store_name", &self.store_name, "store_name must not be empty"));
        }

        if self.max_attempts == 0 {
            return Err(invalid(
                "max_attempts",
                &self.max_attempts.to_string(),
                "max_attempts must be at least 1",
            ));
        }

        if self.default_cache_ttl.is_zero() {
            return Err(invalid(
                "default_cache_ttl",
                &format!("{:?}", self.default_cache_ttl),
                "default_cache_ttl must be positive",
            ));
        }

        if let Some(timeout) = self.connection_wait_timeout {
            if timeout.is_zero() {
                return Err(invalid(
                    "connection_wait_timeout",
                    &format!("{:?}", timeout),
                    "connection_wait_timeout must be positive when set",
                ));
            }
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::StashError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

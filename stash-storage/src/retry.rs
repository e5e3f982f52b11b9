//! Bounded retry for store operations whose connection closes underneath them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stash_core::{StashConfig, StoreError};
use tracing::warn;

use crate::connection::ConnectionManager;
use crate::store::StoreFactory;

/// How many times to run a store operation and how long to pause in between.
///
/// Only [`StoreError::ConnectionClosing`] is retried. Between attempts the
/// closing connection is invalidated, so the next attempt runs on a freshly
/// opened one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Pause before reopening the connection.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn from_config(config: &StashConfig) -> Self {
        Self::new(config.max_attempts, config.retry_backoff)
    }

    /// Run `operation` against the managed connection, retrying on closing
    /// connections until the attempts run out.
    ///
    /// Every attempt acquires the connection anew. Errors other than
    /// `ConnectionClosing`, and the last `ConnectionClosing` once attempts
    /// are exhausted, are returned unchanged.
    pub async fn run<F, T, Op, Fut>(
        &self,
        manager: &ConnectionManager<F>,
        operation: &str,
        mut op: Op,
    ) -> Result<T, StoreError>
    where
        F: StoreFactory,
        Op: FnMut(Arc<F::Store>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let conn = manager.acquire().await?;
            match op(Arc::clone(&conn)).await {
                Ok(value) => return Ok(value),
                Err(StoreError::ConnectionClosing { reason }) if attempt < max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        reason = %reason,
                        "store connection closing, retrying operation"
                    );
                    manager.invalidate(&conn);
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

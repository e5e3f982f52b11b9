//! Lazily opened, shared connection to a document store.
//!
//! The connection state is published through a `tokio::sync::watch` channel.
//! Exactly one caller opens the store; everyone else arriving while it is
//! `Initializing` (or while a clear holds it `Resetting`) parks on the
//! channel and is woken once when the state changes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use stash_core::StoreError;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::store::StoreFactory;

/// Observable state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; the next `acquire` opens one.
    Uninitialized,
    /// A caller is opening the store.
    Initializing,
    /// A connection is open and published.
    Ready,
    /// A clear has taken the connection out of service.
    Resetting,
}

enum Phase<S> {
    Uninitialized,
    Initializing,
    Ready(Arc<S>),
    Resetting,
}

impl<S> Clone for Phase<S> {
    fn clone(&self) -> Self {
        match self {
            Phase::Uninitialized => Phase::Uninitialized,
            Phase::Initializing => Phase::Initializing,
            Phase::Ready(conn) => Phase::Ready(Arc::clone(conn)),
            Phase::Resetting => Phase::Resetting,
        }
    }
}

impl<S> Phase<S> {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Uninitialized => ConnectionState::Uninitialized,
            Phase::Initializing => ConnectionState::Initializing,
            Phase::Ready(_) => ConnectionState::Ready,
            Phase::Resetting => ConnectionState::Resetting,
        }
    }

    fn is_ready_with(&self, conn: &Arc<S>) -> bool {
        matches!(self, Phase::Ready(current) if Arc::ptr_eq(current, conn))
    }
}

/// Owns the single open connection to a named store.
pub struct ConnectionManager<F: StoreFactory> {
    factory: F,
    name: String,
    wait_timeout: Option<Duration>,
    phase: watch::Sender<Phase<F::Store>>,
}

impl<F: StoreFactory> fmt::Debug for ConnectionManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

impl<F: StoreFactory> ConnectionManager<F> {
    /// Create a manager for the store called `name`. Nothing is opened yet.
    pub fn new(factory: F, name: impl Into<String>) -> Self {
        let (phase, _) = watch::channel(Phase::Uninitialized);
        Self {
            factory,
            name: name.into(),
            wait_timeout: None,
            phase,
        }
    }

    /// Bound how long `acquire` may wait for the connection.
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Name of the managed store.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The factory connections are opened with.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.phase.borrow().state()
    }

    /// Get the open connection, opening it first if nobody has.
    ///
    /// Callers arriving while another caller is opening the store wait for
    /// that attempt. If it fails, the error goes to the opener only and the
    /// waiters race to open the store themselves.
    pub async fn acquire(&self) -> Result<Arc<F::Store>, StoreError> {
        match self.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, self.acquire_unbounded())
                .await
                .map_err(|_| {
                    StoreError::fatal(format!(
                        "timed out after {:?} waiting for store {}",
                        limit, self.name
                    ))
                })?,
            None => self.acquire_unbounded().await,
        }
    }

    async fn acquire_unbounded(&self) -> Result<Arc<F::Store>, StoreError> {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = rx.borrow_and_update().clone();
            match phase {
                Phase::Ready(conn) => return Ok(conn),
                Phase::Uninitialized => {
                    if self.claim(|p| matches!(p, Phase::Uninitialized), Phase::Initializing) {
                        return self.initialize().await;
                    }
                }
                Phase::Initializing | Phase::Resetting => {
                    if rx.changed().await.is_err() {
                        return Err(StoreError::fatal(format!(
                            "connection manager for {} shut down",
                            self.name
                        )));
                    }
                }
            }
        }
    }

    async fn initialize(&self) -> Result<Arc<F::Store>, StoreError> {
        let guard = PhaseGuard::new(&self.phase);
        debug!(store = %self.name, "opening store");

        match self.factory.open(&self.name).await {
            Ok(conn) => {
                guard.publish(Arc::clone(&conn));
                debug!(store = %self.name, "store ready");
                Ok(conn)
            }
            Err(e) => {
                warn!(store = %self.name, error = %e, "failed to open store");
                Err(e)
            }
        }
    }

    /// Drop `conn` if it is still the published connection.
    ///
    /// Used after `conn` reported it is closing. A connection someone else
    /// has already replaced is left alone.
    pub fn invalidate(&self, conn: &Arc<F::Store>) -> bool {
        let invalidated = self.claim(|p| p.is_ready_with(conn), Phase::Uninitialized);
        if invalidated {
            debug!(store = %self.name, "connection invalidated");
        }
        invalidated
    }

    /// Take the connection out of service for a reset.
    ///
    /// Opens the store first if needed. Until the returned guard is reopened
    /// or dropped, every `acquire` waits.
    pub async fn begin_reset(&self) -> Result<ResetGuard<'_, F>, StoreError> {
        loop {
            let conn = self.acquire().await?;
            if self.claim(|p| p.is_ready_with(&conn), Phase::Resetting) {
                debug!(store = %self.name, "connection suspended for reset");
                return Ok(ResetGuard {
                    manager: self,
                    conn,
                    finished: false,
                });
            }
        }
    }

    fn claim(&self, expected: impl Fn(&Phase<F::Store>) -> bool, next: Phase<F::Store>) -> bool {
        self.phase.send_if_modified(|phase| {
            if expected(phase) {
                *phase = next;
                true
            } else {
                false
            }
        })
    }
}

/// Reverts an unfinished initialization to `Uninitialized`.
///
/// Covers both a failed open and a caller cancelled mid-open, so the state
/// can never be left `Initializing` with nobody working on it.
struct PhaseGuard<'a, S> {
    phase: &'a watch::Sender<Phase<S>>,
    armed: bool,
}

impl<'a, S> PhaseGuard<'a, S> {
    fn new(phase: &'a watch::Sender<Phase<S>>) -> Self {
        Self { phase, armed: true }
    }

    fn publish(mut self, conn: Arc<S>) {
        self.phase.send_replace(Phase::Ready(conn));
        self.armed = false;
    }
}

impl<S> Drop for PhaseGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.phase.send_replace(Phase::Uninitialized);
        }
    }
}

/// Exclusive hold on a connection taken out of service by
/// [`ConnectionManager::begin_reset`].
///
/// Dropping the guard without calling [`ResetGuard::reopen`] puts the
/// manager back to `Uninitialized`, so the next `acquire` reopens the store.
pub struct ResetGuard<'a, F: StoreFactory> {
    manager: &'a ConnectionManager<F>,
    conn: Arc<F::Store>,
    finished: bool,
}

impl<F: StoreFactory> ResetGuard<'_, F> {
    /// The suspended connection.
    pub fn connection(&self) -> &Arc<F::Store> {
        &self.conn
    }

    /// Open a fresh connection and put it back in service.
    ///
    /// On failure the manager is left `Uninitialized` rather than stuck in
    /// `Resetting`.
    pub async fn reopen(mut self) -> Result<(), StoreError> {
        let manager = self.manager;
        let result = manager.factory.open(&manager.name).await;
        self.finished = true;

        match result {
            Ok(conn) => {
                manager.phase.send_replace(Phase::Ready(conn));
                debug!(store = %manager.name, "store reopened after reset");
                Ok(())
            }
            Err(e) => {
                manager.phase.send_replace(Phase::Uninitialized);
                warn!(store = %manager.name, error = %e, "failed to reopen store after reset");
                Err(e)
            }
        }
    }
}

impl<F: StoreFactory> Drop for ResetGuard<'_, F> {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.phase.send_replace(Phase::Uninitialized);
        }
    }
}

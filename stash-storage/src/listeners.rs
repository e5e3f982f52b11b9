//! Prefix-keyed change listeners.
//!
//! Listeners are grouped by key prefix. A mutation of `key` is delivered to
//! every listener under every prefix that `key` starts with, prefixes in the
//! order they were first registered and listeners in registration order.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use stash_core::KvChange;
use tracing::{error, warn};

/// Callback invoked after a successful mutation.
pub type ListenerFn = Arc<dyn Fn(&KvChange) + Send + Sync>;

/// Wrap a closure as a [`ListenerFn`].
///
/// Keep the returned handle to register the same listener again; anonymous
/// listeners are deduplicated by handle identity.
pub fn listener<L>(callback: L) -> ListenerFn
where
    L: Fn(&KvChange) + Send + Sync + 'static,
{
    Arc::new(callback)
}

struct ListenerEntry {
    name: Option<String>,
    callback: ListenerFn,
}

struct PrefixListeners {
    prefix: String,
    entries: Vec<ListenerEntry>,
}

/// Registry of change listeners keyed by prefix.
pub struct ListenerRegistry {
    prefixes: RwLock<Vec<PrefixListeners>>,
    slow_threshold: Duration,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefixes = self.prefixes.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ListenerRegistry")
            .field(
                "prefixes",
                &prefixes
                    .iter()
                    .map(|p| (p.prefix.as_str(), p.entries.len()))
                    .collect::<Vec<_>>(),
            )
            .field("slow_threshold", &self.slow_threshold)
            .finish()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl ListenerRegistry {
    /// Create an empty registry. Listeners running longer than
    /// `slow_threshold` are reported.
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            prefixes: RwLock::new(Vec::new()),
            slow_threshold,
        }
    }

    /// Register `callback` for keys starting with `prefix`.
    ///
    /// - Named: replaces the callback of the listener with the same name under
    ///   `prefix`, keeping its position; appends if there is none.
    /// - Anonymous: appends unless the same handle is already registered
    ///   under `prefix`.
    pub fn add(&self, prefix: &str, callback: ListenerFn, name: Option<&str>) {
        let mut prefixes = self.prefixes.write().unwrap_or_else(PoisonError::into_inner);

        let index = match prefixes.iter().position(|p| p.prefix == prefix) {
            Some(index) => index,
            None => {
                prefixes.push(PrefixListeners {
                    prefix: prefix.to_string(),
                    entries: Vec::new(),
                });
                prefixes.len() - 1
            }
        };
        let entries = &mut prefixes[index].entries;

        match name {
            Some(name) => {
                match entries
                    .iter_mut()
                    .find(|e| e.name.as_deref() == Some(name))
                {
                    Some(existing) => existing.callback = callback,
                    None => entries.push(ListenerEntry {
                        name: Some(name.to_string()),
                        callback,
                    }),
                }
            }
            None => {
                let registered = entries
                    .iter()
                    .any(|e| e.name.is_none() && Arc::ptr_eq(&e.callback, &callback));
                if !registered {
                    entries.push(ListenerEntry {
                        name: None,
                        callback,
                    });
                }
            }
        }
    }

    /// Remove the listener called `name` under `prefix`.
    ///
    /// Returns whether a listener was removed.
    pub fn remove(&self, prefix: &str, name: &str) -> bool {
        let mut prefixes = self.prefixes.write().unwrap_or_else(PoisonError::into_inner);
        let Some(group) = prefixes.iter_mut().find(|p| p.prefix == prefix) else {
            return false;
        };

        match group
            .entries
            .iter()
            .position(|e| e.name.as_deref() == Some(name))
        {
            Some(index) => {
                group.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of listeners registered under exactly `prefix`.
    pub fn len(&self, prefix: &str) -> usize {
        self.prefixes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.prefix == prefix)
            .map(|p| p.entries.len())
            .unwrap_or(0)
    }

    /// Whether no listener is registered under any prefix.
    pub fn is_empty(&self) -> bool {
        self.prefixes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|p| p.entries.is_empty())
    }

    /// Deliver `change` to every listener whose prefix matches its key.
    ///
    /// Runs synchronously. Listeners are called outside the registry lock,
    /// so they may register or remove listeners themselves. A panicking
    /// listener is logged and skipped; the remaining listeners still run.
    ///
    /// Returns the number of listeners that completed without panicking.
    pub fn notify(&self, change: &KvChange) -> usize {
        let matching: Vec<(String, Option<String>, ListenerFn)> = {
            let prefixes = self.prefixes.read().unwrap_or_else(PoisonError::into_inner);
            prefixes
                .iter()
                .filter(|p| change.key.starts_with(&p.prefix))
                .flat_map(|p| {
                    p.entries
                        .iter()
                        .map(|e| (p.prefix.clone(), e.name.clone(), Arc::clone(&e.callback)))
                })
                .collect()
        };

        let mut delivered = 0;
        for (prefix, name, callback) in matching {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| (*callback)(change)));
            let elapsed = started.elapsed();

            match outcome {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(
                        key = %change.key,
                        op = %change.op,
                        prefix = %prefix,
                        listener = name.as_deref().unwrap_or("<anonymous>"),
                        panic = %message,
                        "listener panicked (recovered)"
                    );
                }
            }

            if elapsed > self.slow_threshold {
                warn!(
                    key = %change.key,
                    prefix = %prefix,
                    listener = name.as_deref().unwrap_or("<anonymous>"),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow listener"
                );
            }
        }

        delivered
    }
}

//! At-most-once resolution cache
//!
//! Each key owns a `OnceCell`, so concurrent first resolutions of the same
//! key run the initializer once while different keys never contend beyond
//! the brief map lookup. A failed initialization drops its cell once no
//! other caller is waiting on it, so failing keys do not accumulate.

use crate::handler::HandlerError;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Concurrent map of lazily initialized values
pub struct ResolutionCache<K, V> {
    entries: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for ResolutionCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> ResolutionCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value for `key`, running `init` if it is not cached yet
    pub async fn get_or_try_init<F, Fut>(&self, key: &K, init: F) -> Result<V, HandlerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, HandlerError>>,
    {
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        if let Some(value) = cell.get() {
            tracing::debug!(key = ?key, "Resolution cache hit");
            return Ok(value.clone());
        }

        let result = cell.get_or_try_init(init).await.cloned();
        if result.is_err() {
            self.discard_failed(key, &cell);
        }
        result
    }

    fn discard_failed(&self, key: &K, cell: &Arc<OnceCell<V>>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only handed out under this lock: two owners means the
        // map and this caller, with nobody else still waiting on the cell
        let unshared = entries.get(key).is_some_and(|entry| {
            Arc::ptr_eq(entry, cell) && Arc::strong_count(cell) == 2 && !cell.initialized()
        });
        if unshared {
            entries.remove(key);
        }
    }

    /// Get a cached value without initializing
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|cell| cell.get().cloned())
    }

    /// Check if `key` holds an initialized value
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Number of initialized entries
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Check if no entry is initialized
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

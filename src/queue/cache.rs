//! Deduplicating queue cache with size-bounded LRU eviction.

use crate::queue::{Queue, QueueKey};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub estimated_bytes: u64,
}

/// Live and finished queues keyed by upstream resource.
pub struct QueueCache {
    entries: Mutex<HashMap<QueueKey, Arc<Queue>>>,
    budget: u64,
    evicting: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for QueueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCache")
            .field("entries", &self.len())
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl QueueCache {
    /// Empty cache that evicts once estimates exceed `budget` bytes.
    pub fn new(budget: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            budget,
            evicting: tokio::sync::Mutex::new(()),
        }
    }

    /// Configured memory budget in bytes.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Number of cached queues, failed ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cached queue for `key`. Failed queues are dropped and never served.
    pub fn get(&self, key: &QueueKey) -> Option<Arc<Queue>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(queue) if queue.is_failed() => {
                tracing::debug!(%key, "dropping failed queue");
                entries.remove(key);
                None
            }
            Some(queue) => Some(Arc::clone(queue)),
            None => None,
        }
    }

    /// Cached queue for `key`, or a new one from `create`. The flag is true
    /// on a cache hit.
    pub fn get_or_insert_with(
        &self,
        key: &QueueKey,
        create: impl FnOnce() -> Queue,
    ) -> (Arc<Queue>, bool) {
        let mut entries = self.entries.lock();
        if let Some(queue) = entries.get(key) {
            if !queue.is_failed() {
                tracing::debug!(%key, "queue cache hit");
                return (Arc::clone(queue), true);
            }
            tracing::debug!(%key, "replacing failed queue");
        }

        let queue = Arc::new(create());
        entries.insert(key.clone(), Arc::clone(&queue));
        tracing::debug!(%key, "queue cache miss");
        (queue, false)
    }

    pub fn stats(&self) -> CacheStats {
        let queues = self.snapshot();
        CacheStats {
            entries: queues.len(),
            estimated_bytes: queues.iter().map(|queue| queue.estimated_size()).sum(),
        }
    }

    /// Drop every entry. Returns how many were removed.
    pub fn evict_all(&self) -> usize {
        let removed = std::mem::take(&mut *self.entries.lock()).len();
        tracing::info!(removed, "queue cache cleared");
        removed
    }

    /// Drop every entry of one site.
    pub fn evict_site(&self, site: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| key.site != site);
        let removed = before - entries.len();
        tracing::info!(site, removed, "site evicted from queue cache");
        removed
    }

    /// Remove least recently used queues until the cache fits its budget.
    ///
    /// Returns `None` without doing anything if another pass is running.
    pub async fn evict(&self) -> Option<usize> {
        let Ok(_pass) = self.evicting.try_lock() else {
            tracing::debug!("eviction already running");
            return None;
        };

        let queues = self.snapshot();
        let sized = tokio::task::spawn_blocking(move || {
            let mut sized: Vec<_> = queues
                .into_iter()
                .map(|queue| (queue.last_used(), queue.estimated_size(), queue))
                .collect();
            sized.sort_by_key(|(last_used, _, _)| *last_used);
            sized
        })
        .await;
        let sized = match sized {
            Ok(sized) => sized,
            Err(error) => {
                tracing::warn!(%error, "cache size computation failed");
                return Some(0);
            }
        };

        let mut total: u64 = sized.iter().map(|(_, size, _)| size).sum();
        let mut removed = 0;
        for (_, size, queue) in sized {
            if total <= self.budget {
                break;
            }
            let mut entries = self.entries.lock();
            if entries
                .get(queue.key())
                .is_some_and(|cached| Arc::ptr_eq(cached, &queue))
            {
                entries.remove(queue.key());
                removed += 1;
            }
            total = total.saturating_sub(size);
        }

        if removed > 0 {
            tracing::info!(removed, remaining_bytes = total, budget = self.budget, "evicted queues");
        }
        Some(removed)
    }

    fn snapshot(&self) -> Vec<Arc<Queue>> {
        self.entries.lock().values().cloned().collect()
    }
}

//! Bounded read-through caches.
//!
//! The read cache maps exact `(branch, keyspace, key, T)` tuples to row
//! results. There is no temporal reasoning inside it: two adjacent `T`
//! values are distinct entries, because a commit may have landed between
//! them. Invalidation on commit is conservative -- every cached entry of a
//! touched row is dropped -- tracked through a side map so no full sweep is
//! needed.
//!
//! The query cache keeps index query results per branch. A commit on a
//! branch invalidates that branch and its descendants, never its ancestors.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use crate::error::{CResult, Error};
use crate::Timestamp;

/// Cache effectiveness counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

type RowKey = (String, String, String);
type ReadKey = (String, String, String, Timestamp);

/// A cached row result: the value at the requested timestamp, or None for an
/// absent/deleted key (caching absence matters as much as presence).
pub type CachedRow = Option<Arc<Vec<u8>>>;

struct ReadState {
    lru: LruCache<ReadKey, CachedRow>,
    by_row: HashMap<RowKey, HashSet<Timestamp>>,
}

impl ReadState {
    fn forget(&mut self, key: &ReadKey) {
        let row = (key.0.clone(), key.1.clone(), key.2.clone());
        if let Some(timestamps) = self.by_row.get_mut(&row) {
            timestamps.remove(&key.3);
            if timestamps.is_empty() {
                self.by_row.remove(&row);
            }
        }
    }
}

/// The bounded point-read cache.
pub struct ReadCache {
    state: Mutex<ReadState>,
    hits: AtomicU64,
    misses: AtomicU64,
    assume_immutable: bool,
}

impl ReadCache {
    /// Creates a cache holding up to `max_size` entries. When
    /// `assume_immutable` is set, lookups hand out the stored value shared;
    /// otherwise every lookup deep-copies.
    pub fn new(max_size: usize, assume_immutable: bool) -> CResult<Self> {
        let capacity = NonZeroUsize::new(max_size)
            .ok_or_else(|| Error::InvalidArgument("cache.maxSize must be at least 1".to_string()))?;
        Ok(Self {
            state: Mutex::new(ReadState {
                lru: LruCache::new(capacity),
                by_row: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            assume_immutable,
        })
    }

    fn state(&self) -> MutexGuard<'_, ReadState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn assume_values_immutable(&self) -> bool {
        self.assume_immutable
    }

    /// Looks up an exact `(branch, keyspace, key, T)` entry.
    pub fn get(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        t: Timestamp,
    ) -> Option<CachedRow> {
        let lookup =
            (branch.to_string(), keyspace.to_string(), key.to_string(), t);
        let mut state = self.state();
        match state.lru.get(&lookup) {
            Some(row) => {
                let row = if self.assume_immutable {
                    row.clone()
                } else {
                    row.as_ref().map(|value| Arc::new(value.as_ref().clone()))
                };
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(row)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Caches a read result. The value bytes are copied in.
    pub fn insert(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        t: Timestamp,
        value: Option<&[u8]>,
    ) {
        let entry_key =
            (branch.to_string(), keyspace.to_string(), key.to_string(), t);
        let row: RowKey = (branch.to_string(), keyspace.to_string(), key.to_string());
        let mut state = self.state();
        if let Some((evicted_key, _)) = state.lru.push(entry_key, value.map(|v| Arc::new(v.to_vec())))
        {
            state.forget(&evicted_key);
        }
        state.by_row.entry(row).or_default().insert(t);
    }

    /// Drops every cached entry of one `(branch, keyspace, key)` row; the
    /// conservative commit invalidation.
    pub fn invalidate_row(&self, branch: &str, keyspace: &str, key: &str) {
        let row: RowKey = (branch.to_string(), keyspace.to_string(), key.to_string());
        let mut state = self.state();
        if let Some(timestamps) = state.by_row.remove(&row) {
            for t in timestamps {
                state.lru.pop(&(row.0.clone(), row.1.clone(), row.2.clone(), t));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

type QueryKey = (String, Timestamp, String);

/// The bounded per-branch cache of index query results (matching keys).
pub struct QueryCache {
    state: Mutex<HashMap<String, LruCache<QueryKey, Arc<Vec<String>>>>>,
    per_branch_capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new(max_size: usize) -> CResult<Self> {
        let capacity = NonZeroUsize::new(max_size).ok_or_else(|| {
            Error::InvalidArgument("queryCache.maxSize must be at least 1".to_string())
        })?;
        Ok(Self {
            state: Mutex::new(HashMap::new()),
            per_branch_capacity: capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn state(
        &self,
    ) -> MutexGuard<'_, HashMap<String, LruCache<QueryKey, Arc<Vec<String>>>>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(
        &self,
        branch: &str,
        keyspace: &str,
        t: Timestamp,
        fingerprint: &str,
    ) -> Option<Arc<Vec<String>>> {
        let mut state = self.state();
        let result = state.get_mut(branch).and_then(|cache| {
            cache.get(&(keyspace.to_string(), t, fingerprint.to_string())).cloned()
        });
        match &result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub fn insert(
        &self,
        branch: &str,
        keyspace: &str,
        t: Timestamp,
        fingerprint: &str,
        keys: Arc<Vec<String>>,
    ) {
        let mut state = self.state();
        let cache = state
            .entry(branch.to_string())
            .or_insert_with(|| LruCache::new(self.per_branch_capacity));
        cache.push((keyspace.to_string(), t, fingerprint.to_string()), keys);
    }

    /// Drops the caches of the given branches. The caller passes the
    /// committed branch and its descendants; ancestor caches stay intact.
    pub fn invalidate_branches(&self, branches: &[String]) {
        let mut state = self.state();
        for branch in branches {
            state.remove(branch);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_hits_only() -> CResult<()> {
        let cache = ReadCache::new(16, true)?;
        cache.insert("master", "ks", "k", 5, Some(b"v"));

        assert_eq!(cache.get("master", "ks", "k", 5), Some(Some(Arc::new(b"v".to_vec()))));
        // Adjacent timestamps are distinct entries.
        assert_eq!(cache.get("master", "ks", "k", 4), None);
        assert_eq!(cache.get("master", "ks", "k", 6), None);
        assert_eq!(cache.get("child", "ks", "k", 5), None);

        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 3 });
        Ok(())
    }

    #[test]
    fn caches_absence() -> CResult<()> {
        let cache = ReadCache::new(16, true)?;
        cache.insert("master", "ks", "gone", 7, None);
        assert_eq!(cache.get("master", "ks", "gone", 7), Some(None));
        Ok(())
    }

    #[test]
    fn row_invalidation_drops_all_timestamps() -> CResult<()> {
        let cache = ReadCache::new(16, true)?;
        cache.insert("master", "ks", "k", 1, Some(b"a"));
        cache.insert("master", "ks", "k", 2, Some(b"b"));
        cache.insert("master", "ks", "other", 1, Some(b"c"));

        cache.invalidate_row("master", "ks", "k");
        assert_eq!(cache.get("master", "ks", "k", 1), None);
        assert_eq!(cache.get("master", "ks", "k", 2), None);
        assert!(cache.get("master", "ks", "other", 1).is_some());
        Ok(())
    }

    #[test]
    fn eviction_keeps_side_map_consistent() -> CResult<()> {
        let cache = ReadCache::new(2, true)?;
        cache.insert("master", "ks", "a", 1, Some(b"1"));
        cache.insert("master", "ks", "b", 1, Some(b"2"));
        cache.insert("master", "ks", "c", 1, Some(b"3")); // evicts a@1
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("master", "ks", "a", 1), None);

        // Invalidating the evicted row is a no-op, not a panic.
        cache.invalidate_row("master", "ks", "a");
        assert!(cache.get("master", "ks", "c", 1).is_some());
        Ok(())
    }

    #[test]
    fn lookup_sharing_follows_the_immutability_flag() -> CResult<()> {
        let shared = ReadCache::new(4, true)?;
        shared.insert("master", "ks", "k", 1, Some(b"v"));
        let first = shared.get("master", "ks", "k", 1).flatten().unwrap();
        let second = shared.get("master", "ks", "k", 1).flatten().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let copied = ReadCache::new(4, false)?;
        copied.insert("master", "ks", "k", 1, Some(b"v"));
        let first = copied.get("master", "ks", "k", 1).flatten().unwrap();
        let second = copied.get("master", "ks", "k", 1).flatten().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn query_cache_invalidates_per_branch() -> CResult<()> {
        let cache = QueryCache::new(8)?;
        let keys = Arc::new(vec!["k1".to_string()]);
        cache.insert("master", "ks", 5, "name:eq", keys.clone());
        cache.insert("child", "ks", 5, "name:eq", keys);

        assert!(cache.get("master", "ks", 5, "name:eq").is_some());
        assert!(cache.get("child", "ks", 5, "name:eq").is_some());

        // A commit on child invalidates child only.
        cache.invalidate_branches(&["child".to_string()]);
        assert!(cache.get("master", "ks", 5, "name:eq").is_some());
        assert!(cache.get("child", "ks", 5, "name:eq").is_none());
        Ok(())
    }
}

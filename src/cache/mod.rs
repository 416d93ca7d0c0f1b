//! Bounded LRU cache shared by the exception monitor and the performance store
//!
//! A thin thread-safe wrapper around [`lru::LruCache`]. Every instance owns
//! exactly one mutex; callers must not assume atomicity across caches.

use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// How many entries a cache may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Tracking disabled, `put` is a no-op
    Disabled,
    /// At most this many entries
    Bounded(NonZeroUsize),
    /// No limit
    Unbounded,
}

impl Capacity {
    /// Interpret a configured limit: `0` disables, `-1` (or any negative) is unbounded
    pub fn from_limit(limit: i64) -> Self {
        if limit < 0 {
            return Capacity::Unbounded;
        }
        match usize::try_from(limit).ok().and_then(NonZeroUsize::new) {
            Some(n) => Capacity::Bounded(n),
            None => Capacity::Disabled,
        }
    }

    /// Maximum number of entries, `None` when unbounded
    pub fn max_size(&self) -> Option<usize> {
        match self {
            Capacity::Disabled => Some(0),
            Capacity::Bounded(n) => Some(n.get()),
            Capacity::Unbounded => None,
        }
    }
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capacity::Disabled => write!(f, "disabled"),
            Capacity::Bounded(n) => write!(f, "{}", n),
            Capacity::Unbounded => write!(f, "unlimited"),
        }
    }
}

/// Thread-safe least-recently-used store
pub struct BoundedCache<K: Hash + Eq, V> {
    capacity: Capacity,
    // None when tracking is disabled
    inner: Option<Mutex<lru::LruCache<K, V>>>,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    /// Create a cache with the given capacity
    pub fn new(capacity: Capacity) -> Self {
        let inner = match capacity {
            Capacity::Disabled => None,
            Capacity::Bounded(n) => Some(Mutex::new(lru::LruCache::new(n))),
            Capacity::Unbounded => Some(Mutex::new(lru::LruCache::unbounded())),
        };
        Self { capacity, inner }
    }

    /// Create a cache from a configured integer limit
    pub fn with_limit(limit: i64) -> Self {
        Self::new(Capacity::from_limit(limit))
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Insert or replace a value, making it the most recently used entry.
    ///
    /// Returns the least-recently-used entry when the insert pushed the cache
    /// over capacity. Replacing an existing key never evicts.
    pub fn put(&self, key: K, value: V) -> Option<(K, V)> {
        let inner = self.inner.as_ref()?;
        let mut cache = inner.lock();
        if let Some(existing) = cache.get_mut(&key) {
            *existing = value;
            return None;
        }
        cache.push(key, value)
    }

    /// Look up a value and promote it to most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.as_ref()?;
        inner.lock().get(key).cloned()
    }

    /// Look up a value without touching recency
    pub fn peek(&self, key: &K) -> Option<V> {
        let inner = self.inner.as_ref()?;
        inner.lock().peek(key).cloned()
    }

    /// Apply `f` to an existing entry in place; returns false on a miss
    pub fn update<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        let Some(inner) = self.inner.as_ref() else {
            return false;
        };
        match inner.lock().get_mut(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let inner = self.inner.as_ref()?;
        inner.lock().pop(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .as_ref()
            .map(|inner| inner.lock().contains(key))
            .unwrap_or(false)
    }

    /// Snapshot of all values, most recently used first
    pub fn values(&self) -> Vec<V> {
        match self.inner.as_ref() {
            Some(inner) => inner.lock().iter().map(|(_, v)| v.clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Remove every entry, returning the values oldest first
    pub fn clear(&self) -> Vec<V> {
        let Some(inner) = self.inner.as_ref() else {
            return Vec::new();
        };
        let mut cache = inner.lock();
        let mut drained = Vec::with_capacity(cache.len());
        while let Some((_, value)) = cache.pop_lru() {
            drained.push(value);
        }
        drained
    }

    pub fn size(&self) -> usize {
        self.inner.as_ref().map(|inner| inner.lock().len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.capacity)
            .finish()
    }
}

//! Most-recently-used cache.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Get hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    /// Get miss count.
    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    /// Get eviction count.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(AtomicOrdering::Relaxed)
    }

    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

type Equality<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Bounded list of items, most recently used first.
///
/// Items are matched with a caller-supplied equality rather than hashing, so
/// structurally compared values such as query templates can key the cache.
pub struct MruCache<T> {
    items: RwLock<Vec<T>>,
    capacity: usize,
    equals: Equality<T>,
    stats: CacheStats,
}

impl<T: Clone> MruCache<T> {
    pub fn new(capacity: usize, equals: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            items: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
            equals: Box::new(equals),
            stats: CacheStats::default(),
        }
    }

    /// Find the cached item equal to `item`, moving it to the front.
    ///
    /// Returns `(true, cached)` on a hit. On a miss the item is inserted at
    /// the front when `insert_if_absent` is set, evicting the least recently
    /// used item past capacity, and `(false, item)` is returned.
    pub fn lookup(&self, item: T, insert_if_absent: bool) -> (bool, T) {
        // Fast path: the most recent item needs no reordering.
        {
            let items = self.items.read();
            if let Some(first) = items.first() {
                if (self.equals)(first, &item) {
                    self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                    return (true, first.clone());
                }
            }
        }

        let items = self.items.upgradable_read();
        match items.iter().position(|cached| (self.equals)(cached, &item)) {
            Some(index) => {
                let mut items = RwLockUpgradableReadGuard::upgrade(items);
                let found = items.remove(index);
                items.insert(0, found.clone());
                self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                (true, found)
            }
            None => {
                self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
                if insert_if_absent && self.capacity > 0 {
                    let mut items = RwLockUpgradableReadGuard::upgrade(items);
                    items.insert(0, item.clone());
                    if items.len() > self.capacity {
                        items.truncate(self.capacity);
                        self.stats.evictions.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                }
                (false, item)
            }
        }
    }

    /// Snapshot of the cached items, most recently used first.
    pub fn items(&self) -> Vec<T> {
        self.items.read().clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn clear(&self) {
        self.items.write().clear();
    }
}

impl<T> fmt::Debug for MruCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MruCache")
            .field("len", &self.items.read().len())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats)
            .finish()
    }
}

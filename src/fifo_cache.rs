//! # FIFO Cache
//!
//! An insertion-ordered map with first-in-first-out eviction.
//! Used by the viewport cache to bound the number of stored markers.
//!
//! Reads never change eviction order. Re-inserting an existing key moves it to the back,
//! so a marker seen in a fresh fetch outlives markers from older fetches.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// A FIFO cache with O(n) re-insertion.
///
/// For marker sets of a few hundred entries, the linear scan when moving a key to the
/// back is acceptable and simpler than an intrusive list.
#[derive(Debug, Clone)]
pub struct FifoCache<K, V> {
    capacity: usize,
    entries: HashMap<K, CacheEntry<V>>,
    order: VecDeque<K>,
    insert_counter: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted: u64,
}

impl<K: Eq + Hash + Clone, V> FifoCache<K, V> {
    /// Create a new FIFO cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            insert_counter: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get a value without touching its position.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Insertion sequence number of a key (higher = newer).
    pub fn insertion_order(&self, key: &K) -> Option<u64> {
        self.entries.get(key).map(|e| e.inserted)
    }

    /// Insert or overwrite a value and move it to the back.
    ///
    /// Does not evict; call [`FifoCache::evict_overflow`] once a batch is merged so
    /// a single fetch larger than capacity still keeps its newest entries.
    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.insert_counter += 1;
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted: self.insert_counter,
            },
        );
    }

    /// Evict oldest entries until at or under capacity. Returns the evicted keys, oldest first.
    pub fn evict_overflow(&mut self) -> Vec<K> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(key) => {
                    self.entries.remove(&key);
                    evicted.push(key);
                }
                None => break,
            }
        }
        evicted
    }

    /// Clear all entries from the cache.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if the cache contains a key.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys from oldest to newest.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    /// Values from oldest to newest.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.order
            .iter()
            .filter_map(move |k| self.entries.get(k).map(|e| &e.value))
    }

    /// Change capacity, evicting immediately if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<K> {
        self.capacity = capacity;
        self.evict_overflow()
    }
}

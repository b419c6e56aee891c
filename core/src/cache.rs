//! Per-column FIFO value cache.
//!
//! Eviction is strict insertion order. A `put` on an already-cached key hash
//! does not move it to the back of the queue. Recency of access never
//! matters here, only recency of the write that populated the slot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// What the cache stores per key hash: the value is cloned in, not borrowed,
/// so callers may recycle their own buffers after a `put`.
#[derive(Debug, Clone)]
pub struct CacheValue {
    pub value: Option<Vec<u8>>,
    pub timestamp: i64,
    pub mixed_offset: i32,
}

pub struct Cache {
    capacity: usize,
    map: HashMap<i32, CacheValue>,
    order: VecDeque<i32>,
    hits: AtomicU64,
    misses: AtomicU64,
    read_count: AtomicU64,
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            read_count: AtomicU64::new(0),
        }
    }

    /// Looks up `key_hash`, counting the call as a hit or a miss.
    pub fn get(&self, key_hash: i32) -> Option<CacheValue> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        match self.map.get(&key_hash) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or overwrites `key_hash`. A fresh key may evict the oldest
    /// entry once the cache is at capacity; overwriting an existing key
    /// leaves its position in the FIFO queue untouched.
    pub fn put(&mut self, key_hash: i32, value: CacheValue) {
        if !self.map.contains_key(&key_hash) {
            if self.order.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
            self.order.push_back(key_hash);
        }
        self.map.insert(key_hash, value);
    }

    /// Evicts the given key hashes, if present.
    pub fn remove(&mut self, key_hashes: &[i32]) {
        for key_hash in key_hashes {
            if self.map.remove(key_hash).is_some() {
                self.order.retain(|k| k != key_hash);
            }
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }

    /// Total number of `get` calls observed, never reset by `reset_hit_rate`.
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn reset_hit_rate(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

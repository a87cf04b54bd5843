//! Bounded hash cache with TTL and max-size eviction.
//!
//! Each chain keeps the external tx hashes this node broadcast in one of these
//! so the classifier recognises its own outbound transactions. Entries are
//! ~80 bytes (hash string + Instant), so the default 10k entries stay under
//! 1 MB per chain.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::normalize_hash;

pub const DEFAULT_WATCH_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_WATCH_TTL_SECS: u64 = 7 * 86_400;

/// Bounded set of transaction hashes.
///
/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are dropped on insert and never reported.
///
/// Keys are normalized (no `0x`, lowercase) so adapters that disagree on hash
/// formatting still match.
#[derive(Debug)]
pub struct BoundedHashCache {
    map: HashMap<String, Instant>,
    max_size: usize,
    ttl: Duration,
}

impl Default for BoundedHashCache {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_CACHE_SIZE, DEFAULT_WATCH_TTL_SECS)
    }
}

impl BoundedHashCache {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.map
            .get(&normalize_hash(hash))
            .is_some_and(|&t| t.elapsed() < self.ttl)
    }

    pub fn insert(&mut self, hash: &str) {
        let now = Instant::now();
        self.map.retain(|_, &mut t| now.duration_since(t) < self.ttl);
        while self.map.len() >= self.max_size {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, t)| **t)
                .map(|(h, _)| h.clone());
            match oldest {
                Some(h) => {
                    self.map.remove(&h);
                }
                None => break,
            }
        }
        self.map.insert(normalize_hash(hash), now);
    }

    pub fn remove(&mut self, hash: &str) -> bool {
        self.map.remove(&normalize_hash(hash)).is_some()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_lookup() {
        let mut cache = BoundedHashCache::new(10, 3600);
        cache.insert("0xABCD");
        assert!(cache.contains("abcd"));
        assert!(cache.contains("0xabcd"));
        assert!(!cache.contains("abce"));
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let mut cache = BoundedHashCache::new(2, 3600);
        cache.insert("01");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("02");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("03");
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("01"));
        assert!(cache.contains("02"));
        assert!(cache.contains("03"));
    }

    #[test]
    fn test_expired_entries_not_reported() {
        let mut cache = BoundedHashCache::new(10, 0);
        cache.insert("01");
        assert!(!cache.contains("01"));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = BoundedHashCache::default();
        cache.insert("01");
        cache.insert("02");
        assert!(cache.remove("0x01"));
        assert!(!cache.remove("01"));
        cache.clear();
        assert!(cache.is_empty());
    }
}

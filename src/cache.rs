//! Local cache of recent admissions.
//!
//! Only allowed results are cached, so a cache hit can never turn into a
//! denial the store did not make. Eviction is first-in-first-out: every
//! insert gets a generation number and the oldest live generation goes
//! first once the cache is full.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::algorithms::Algorithm;
use crate::clock::SharedClock;
use crate::result::RateLimitResult;

/// Above this share of the limit, entries live half as long.
const HIGH_UTILIZATION: f64 = 0.8;

#[derive(Debug, Clone)]
struct CacheEntry {
    identifier: String,
    result: RateLimitResult,
    expires_at: u64,
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<(u64, String)>,
    next_generation: u64,
}

impl CacheInner {
    fn evict_oldest(&mut self) -> bool {
        while let Some((generation, key)) = self.order.pop_front() {
            let current = self.entries.get(&key).map(|e| e.generation);
            if current == Some(generation) {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    /// Drop queue slots whose entry was replaced or removed.
    fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(generation, key)| entries.get(key).map(|e| e.generation) == Some(*generation));
    }
}

#[derive(Debug)]
pub struct LocalCache {
    max_entries: usize,
    ttl_ms: u64,
    clock: SharedClock,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LocalCache {
    pub fn new(max_entries: usize, ttl_ms: u64, clock: SharedClock) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl_ms,
            clock,
            inner: Mutex::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn key(identifier: &str, limit: u64, window_ms: u64, algorithm: Algorithm) -> String {
        format!("{}:{}:{}:{}", identifier, limit, window_ms, algorithm)
    }

    pub fn get(&self, key: &str) -> Option<RateLimitResult> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().ok()?;

        let expires_at = inner.entries.get(key).map(|e| e.expires_at);
        let hit = match expires_at {
            Some(at) if at > now => inner.entries.get(key).map(|e| e.result.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };

        match &hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit.map(RateLimitResult::as_cached)
    }

    /// Cache an allowed result. Denials are ignored.
    pub fn insert(&self, key: &str, identifier: &str, result: &RateLimitResult) {
        if !result.allowed {
            return;
        }

        let now = self.clock.now_ms();
        let mut ttl = self.ttl_ms.min(result.reset_time.saturating_sub(now));
        if result.utilization() > HIGH_UTILIZATION {
            ttl /= 2;
        }
        if ttl == 0 {
            return;
        }

        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if !inner.entries.contains_key(key) {
            while inner.entries.len() >= self.max_entries {
                if !inner.evict_oldest() {
                    break;
                }
            }
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.order.push_back((generation, key.to_string()));
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                identifier: identifier.to_string(),
                result: result.clone(),
                expires_at: now + ttl,
                generation,
            },
        );

        if inner.order.len() > self.max_entries * 2 {
            inner.compact();
        }
    }

    /// Remove every entry for `identifier`, whatever its limit or algorithm.
    pub fn invalidate_identifier(&self, identifier: &str) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.identifier != identifier);
        let removed = before - inner.entries.len();
        if removed > 0 {
            inner.compact();
            debug!(%identifier, removed, "Invalidated cached results");
        }
        removed
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        let removed = before - inner.entries.len();
        if removed > 0 {
            inner.compact();
        }
        removed
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.order.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rough heap footprint of the cached entries.
    pub fn approximate_bytes(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .entries
                    .iter()
                    .map(|(k, e)| {
                        k.len() * 2 + e.identifier.len() + std::mem::size_of::<CacheEntry>()
                    })
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::algorithms::Decision;
    use crate::clock::ManualClock;

    fn cache(max_entries: usize, ttl_ms: u64) -> (LocalCache, ManualClock) {
        let clock = ManualClock::new(100_000);
        (LocalCache::new(max_entries, ttl_ms, Arc::new(clock.clone())), clock)
    }

    fn result(allowed: bool, total_hits: i64, reset_time: u64) -> RateLimitResult {
        RateLimitResult::from_decision(
            Decision {
                allowed,
                total_hits,
                remaining: (10 - total_hits).max(0) as u64,
                reset_time,
                window_start: 0,
                window_end: reset_time,
                retry_after: (!allowed).then_some(100),
            },
            10,
            Algorithm::SlidingWindow,
        )
    }

    #[test]
    fn test_hit_is_marked_cached() {
        let (cache, _) = cache(10, 1_000);
        cache.insert("k", "user", &result(true, 1, 200_000));
        let hit = cache.get("k").unwrap();
        assert!(hit.cached);
        assert_eq!(cache.hit_count(), 1);
        assert!(cache.get("other").is_none());
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn test_never_caches_denials() {
        let (cache, _) = cache(10, 1_000);
        cache.insert("k", "user", &result(false, 10, 200_000));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_capped_by_reset_time() {
        let (cache, clock) = cache(10, 1_000);
        cache.insert("k", "user", &result(true, 1, 100_300));
        clock.advance(Duration::from_millis(299));
        assert!(cache.get("k").is_some());
        clock.advance(Duration::from_millis(1));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_high_utilization_halves_ttl() {
        let (cache, clock) = cache(10, 1_000);
        cache.insert("k", "user", &result(true, 9, 200_000));
        clock.advance(Duration::from_millis(500));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_fifo_eviction() {
        let (cache, _) = cache(2, 1_000);
        cache.insert("a", "a", &result(true, 1, 200_000));
        cache.insert("b", "b", &result(true, 1, 200_000));
        cache.insert("c", "c", &result(true, 1, 200_000));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_invalidate_identifier_matches_exactly() {
        let (cache, _) = cache(10, 1_000);
        cache.insert(&LocalCache::key("user", 10, 1_000, Algorithm::SlidingWindow), "user", &result(true, 1, 200_000));
        cache.insert(&LocalCache::key("user", 20, 1_000, Algorithm::TokenBucket), "user", &result(true, 1, 200_000));
        cache.insert(&LocalCache::key("user:1", 10, 1_000, Algorithm::SlidingWindow), "user:1", &result(true, 1, 200_000));

        assert_eq!(cache.invalidate_identifier("user"), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let (cache, clock) = cache(10, 100);
        cache.insert("a", "a", &result(true, 1, 200_000));
        clock.advance(Duration::from_millis(100));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }
}

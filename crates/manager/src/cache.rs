//! In-memory duplicate-suppression cache.
//!
//! `check_and_add` is the whole contract: for concurrent callers
//! racing on the same fingerprint, exactly one sees `Miss`. The cache
//! is striped so the critical section is per-shard, and the lock is
//! never held across the database write that follows a miss; a
//! failed insert is rolled back with `remove` instead.

use std::collections::{HashSet, VecDeque};
use std::hash::{BuildHasher, RandomState};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use ctsieve_core::api::CacheStats;
use ctsieve_core::fingerprint::CertFingerprint;

const SHARDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

#[derive(Default)]
struct Shard {
    present: HashSet<CertFingerprint>,
    /// FIFO eviction order; entries removed out of band are dropped
    /// from here too so `order` and `present` stay in lockstep.
    order: VecDeque<CertFingerprint>,
}

pub struct DedupCache {
    shards: Vec<Mutex<Shard>>,
    shard_cap: usize,
    max_size: usize,
    hasher: RandomState,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DedupCache {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(Shard::default())).collect(),
            shard_cap: (max_size / SHARDS).max(1),
            max_size,
            hasher: RandomState::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard(&self, fp: &CertFingerprint) -> &Mutex<Shard> {
        let idx = self.hasher.hash_one(fp) as usize % self.shards.len();
        &self.shards[idx]
    }

    pub fn check_and_add(&self, fp: &CertFingerprint) -> CacheOutcome {
        let mut shard = self.shard(fp).lock().expect("cache shard poisoned");
        if shard.present.contains(fp) {
            drop(shard);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return CacheOutcome::Hit;
        }

        shard.present.insert(fp.clone());
        shard.order.push_back(fp.clone());
        while shard.present.len() > self.shard_cap {
            if let Some(evicted) = shard.order.pop_front() {
                shard.present.remove(&evicted);
            } else {
                break;
            }
        }
        drop(shard);
        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheOutcome::Miss
    }

    /// Roll a fingerprint back out after a failed insert so a later
    /// retry is not falsely suppressed.
    pub fn remove(&self, fp: &CertFingerprint) -> bool {
        let mut shard = self.shard(fp).lock().expect("cache shard poisoned");
        if shard.present.remove(fp) {
            shard.order.retain(|seen| seen != fp);
            true
        } else {
            false
        }
    }

    pub fn size(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().expect("cache shard poisoned").present.len())
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total_requests = hit_count + miss_count;
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            hit_count as f64 / total_requests as f64
        };
        CacheStats {
            cache_size: self.size() as u64,
            max_size: self.max_size as u64,
            hit_count,
            miss_count,
            total_requests,
            hit_rate,
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().expect("cache shard poisoned");
            shard.present.clear();
            shard.order.clear();
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn fp(serial: u64) -> CertFingerprint {
        CertFingerprint {
            issuer: "C=JP, O=Ctsieve Test".into(),
            serial_number: serial.to_string(),
            not_before: 1_700_000_000,
            not_after: 1_731_536_000,
            common_name: "a.example.jp".into(),
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = DedupCache::new(1_000);
        assert_eq!(cache.check_and_add(&fp(1)), CacheOutcome::Miss);
        assert_eq!(cache.check_and_add(&fp(1)), CacheOutcome::Hit);
        assert_eq!(cache.check_and_add(&fp(2)), CacheOutcome::Miss);
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn exactly_one_miss_under_contention() {
        let cache = Arc::new(DedupCache::new(1_000));
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.check_and_add(&fp(42))
                })
            })
            .collect();

        let misses = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == CacheOutcome::Miss)
            .count();
        assert_eq!(misses, 1);
    }

    #[test]
    fn capacity_is_bounded_and_new_entries_still_miss() {
        let cache = DedupCache::new(64);
        for serial in 0..1_000 {
            cache.check_and_add(&fp(serial));
        }
        assert!(cache.size() <= 64);
        assert_eq!(cache.check_and_add(&fp(1_000_000)), CacheOutcome::Miss);
        assert!(cache.size() <= 64);
    }

    #[test]
    fn remove_rolls_back_a_miss() {
        let cache = DedupCache::new(1_000);
        assert_eq!(cache.check_and_add(&fp(7)), CacheOutcome::Miss);
        assert!(cache.remove(&fp(7)));
        assert!(!cache.remove(&fp(7)));
        assert_eq!(cache.check_and_add(&fp(7)), CacheOutcome::Miss);
    }

    #[test]
    fn stats_identity_holds() {
        let cache = DedupCache::new(1_000);
        cache.check_and_add(&fp(1));
        cache.check_and_add(&fp(1));
        cache.check_and_add(&fp(2));

        let stats = cache.stats();
        assert_eq!(stats.hit_count + stats.miss_count, stats.total_requests);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 2);
        assert!((stats.hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.cache_size, 2);
        assert_eq!(stats.max_size, 1_000);
    }

    #[test]
    fn clear_resets_everything() {
        let cache = DedupCache::new(1_000);
        cache.check_and_add(&fp(1));
        cache.check_and_add(&fp(1));
        cache.clear();

        let stats = cache.stats();
        assert_eq!(cache.size(), 0);
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(cache.check_and_add(&fp(1)), CacheOutcome::Miss);
    }
}

//! ChecksumCache: a sharded, read-mostly map keyed by absolute path.
//!
//! Readers take a shared lock and bump an atomic `access_count` on a hit, so
//! concurrent hits never contend on an exclusive guard. A cold key (miss, or
//! a stale size/mtime) takes the shard's exclusive guard and re-checks under
//! it before computing, so two workers racing on the same cold path don't
//! both pay for the checksum — the "double-check" pattern DESIGN NOTES calls
//! load-bearing.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

const SHARD_COUNT: usize = 16;

struct CacheEntry {
    checksum: [u8; 32],
    size: u64,
    mtime: DateTime<Utc>,
    created_at: DateTime<Utc>,
    access_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

pub struct ChecksumCache {
    shards: Vec<RwLock<HashMap<PathBuf, CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard_index(path: &Path) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        path.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    /// Returns the cached checksum for `path` if `size`/`mtime` match exactly;
    /// otherwise computes a fresh one via `compute` and replaces the entry.
    pub fn get_or_compute(
        &self,
        path: &Path,
        size: u64,
        mtime: DateTime<Utc>,
        compute: impl FnOnce() -> anyhow::Result<[u8; 32]>,
    ) -> anyhow::Result<[u8; 32]> {
        let idx = Self::shard_index(path);
        let shard = &self.shards[idx];

        {
            let guard = shard.read();
            if let Some(entry) = guard.get(path) {
                if entry.size == size && entry.mtime == mtime {
                    entry.access_count.fetch_add(1, Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.checksum);
                }
            }
        }

        let mut guard = shard.write();
        // Double-check: another thread may have computed this while we waited.
        if let Some(entry) = guard.get(path) {
            if entry.size == size && entry.mtime == mtime {
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.checksum);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let checksum = compute()?;
        guard.insert(
            path.to_path_buf(),
            CacheEntry {
                checksum,
                size,
                mtime,
                created_at: Utc::now(),
                access_count: AtomicU64::new(1),
            },
        );
        Ok(checksum)
    }

    /// Evicts entries older than `max_age` first; if still over `max_size`,
    /// evicts in ascending order of `access_count` until within bound.
    pub fn cleanup(&self, max_age: Duration, max_size: usize) {
        let now = Utc::now();

        for shard in &self.shards {
            let mut guard = shard.write();
            guard.retain(|_, entry| {
                match (now - entry.created_at).to_std() {
                    Ok(age) => age <= max_age,
                    Err(_) => true,
                }
            });
        }

        let total: usize = self.shards.iter().map(|s| s.read().len()).sum();
        if total <= max_size {
            return;
        }

        let mut candidates: Vec<(usize, PathBuf, u64)> = Vec::with_capacity(total);
        for (shard_idx, shard) in self.shards.iter().enumerate() {
            let guard = shard.read();
            for (path, entry) in guard.iter() {
                candidates.push((shard_idx, path.clone(), entry.access_count.load(Ordering::Relaxed)));
            }
        }
        candidates.sort_by_key(|(_, _, count)| *count);

        let to_evict = total - max_size;
        for (shard_idx, path, _) in candidates.into_iter().take(to_evict) {
            self.shards[shard_idx].write().remove(&path);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.shards.iter().map(|s| s.read().len()).sum(),
        }
    }
}

impl Default for ChecksumCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn hit_requires_exact_size_and_mtime() {
        let cache = ChecksumCache::new();
        let path = PathBuf::from("/tmp/a");
        let mtime = Utc::now();

        let v1 = cache.get_or_compute(&path, 100, mtime, || Ok([1u8; 32])).unwrap();
        assert_eq!(v1, [1u8; 32]);
        assert_eq!(cache.stats().misses, 1);

        // same size/mtime -> hit, compute must not run
        let v2 = cache
            .get_or_compute(&path, 100, mtime, || panic!("should not recompute on hit"))
            .unwrap();
        assert_eq!(v2, [1u8; 32]);
        assert_eq!(cache.stats().hits, 1);

        // size differs -> recompute and replace
        let v3 = cache.get_or_compute(&path, 101, mtime, || Ok([2u8; 32])).unwrap();
        assert_eq!(v3, [2u8; 32]);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn cold_key_is_computed_once_under_contention() {
        let cache = ChecksumCache::new();
        let path = PathBuf::from("/tmp/contended");
        let mtime = Utc::now();
        let calls = AtomicU32::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache
                        .get_or_compute(&path, 42, mtime, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok([9u8; 32])
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_evicts_by_access_count_when_over_size() {
        let cache = ChecksumCache::new();
        let mtime = Utc::now();
        for i in 0..5 {
            let path = PathBuf::from(format!("/tmp/file{i}"));
            cache.get_or_compute(&path, i as u64, mtime, || Ok([i as u8; 32])).unwrap();
        }
        // touch file4 repeatedly so it survives eviction
        for _ in 0..3 {
            cache
                .get_or_compute(&PathBuf::from("/tmp/file4"), 4, mtime, || panic!("cached"))
                .unwrap();
        }
        cache.cleanup(Duration::from_secs(3600), 1);
        assert_eq!(cache.stats().size, 1);
    }
}

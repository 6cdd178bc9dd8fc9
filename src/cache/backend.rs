//! Cache backend trait and the in-process LRU implementation.

use super::clock::{Clock, SystemClock};
use super::entry::CacheEntry;
use super::key::Fingerprint;
use crate::{Error, ErrorContext, Result};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Storage strategy for cache entries.
///
/// Implementations own their medium exclusively. `get` must treat an expired entry as absent
/// and should remove it before returning.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>>;
    /// Unconditional overwrite.
    fn put(&self, key: &Fingerprint, entry: CacheEntry) -> Result<()>;
    /// Idempotent; deleting an absent key is not an error.
    fn delete(&self, key: &Fingerprint) -> Result<()>;
    fn clear(&self) -> Result<()>;
    /// Number of live entries.
    fn len(&self) -> Result<usize>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Physically remove expired entries, returning how many were dropped.
    fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str;
    /// Whether operations touch slow media (disk, network). The async facade moves such
    /// calls onto tokio's blocking pool instead of running them on a worker thread.
    fn blocks_on_io(&self) -> bool {
        false
    }
    /// Time source used for expiry; entries stored through this backend are stamped with it.
    fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }
}

/// Bounded in-process cache with least-recently-used eviction.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    max_size: NonZeroUsize,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    /// Fails with a configuration error when `max_size` is zero.
    pub fn new(max_size: usize) -> Result<Self> {
        let max_size = NonZeroUsize::new(max_size).ok_or_else(|| {
            Error::configuration_with_context(
                "max_size must be greater than zero",
                ErrorContext::new()
                    .with_field_path("max_size")
                    .with_source("memory_cache"),
            )
        })?;
        Ok(Self::with_capacity(max_size))
    }

    pub fn with_capacity(max_size: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(max_size)),
            max_size,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size.get()
    }

    // Map bookkeeping never panics midway, so a poisoned lock still guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let expired = match entries.peek(key.as_str()) {
            Some(entry) => entry.is_expired(now),
            None => return Ok(None),
        };
        if expired {
            entries.pop(key.as_str());
            debug!(fingerprint = %key, "memory cache entry expired");
            return Ok(None);
        }
        Ok(entries.get_mut(key.as_str()).map(|entry| {
            entry.touch(now);
            entry.clone()
        }))
    }

    fn put(&self, key: &Fingerprint, entry: CacheEntry) -> Result<()> {
        let mut entries = self.lock();
        if let Some((evicted, _)) = entries.push(key.as_str().to_string(), entry) {
            if evicted != key.as_str() {
                debug!(evicted = %evicted, max_size = self.max_size.get(), "memory cache evicted LRU entry");
            }
        }
        Ok(())
    }

    fn delete(&self, key: &Fingerprint) -> Result<()> {
        self.lock().pop(key.as_str());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let now = self.clock.now();
        Ok(self
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .count())
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            entries.pop(k.as_str());
        }
        Ok(expired.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn entry(v: serde_json::Value) -> CacheEntry {
        CacheEntry::new(v, None, 0.0)
    }

    #[test]
    fn test_zero_max_size_fails_eagerly() {
        let err = MemoryCache::new(0).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_put_get_delete_clear() {
        let cache = MemoryCache::new(10).unwrap();
        let k = Fingerprint::from("k");
        cache.put(&k, entry(json!("A"))).unwrap();
        assert_eq!(cache.get(&k).unwrap().unwrap().payload(), &json!("A"));

        cache.put(&k, entry(json!("B"))).unwrap();
        assert_eq!(cache.get(&k).unwrap().unwrap().payload(), &json!("B"));
        assert_eq!(cache.len().unwrap(), 1);

        cache.delete(&k).unwrap();
        cache.delete(&k).unwrap();
        assert!(cache.get(&k).unwrap().is_none());

        cache.put(&"a".into(), entry(json!(1))).unwrap();
        cache.put(&"b".into(), entry(json!(2))).unwrap();
        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_lru_eviction_on_put() {
        let cache = MemoryCache::new(2).unwrap();
        cache.put(&"a".into(), entry(json!(1))).unwrap();
        cache.put(&"b".into(), entry(json!(2))).unwrap();
        cache.put(&"c".into(), entry(json!(3))).unwrap();
        assert!(cache.get(&"a".into()).unwrap().is_none());
        assert!(cache.get(&"b".into()).unwrap().is_some());
        assert!(cache.get(&"c".into()).unwrap().is_some());
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache = MemoryCache::new(2).unwrap();
        cache.put(&"a".into(), entry(json!(1))).unwrap();
        cache.put(&"b".into(), entry(json!(2))).unwrap();
        assert!(cache.get(&"a".into()).unwrap().is_some());
        cache.put(&"c".into(), entry(json!(3))).unwrap();
        assert!(cache.get(&"b".into()).unwrap().is_none());
        assert!(cache.get(&"a".into()).unwrap().is_some());
    }

    #[test]
    fn test_expired_entry_is_absent_and_removed() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let cache = MemoryCache::new(4).unwrap().with_clock(clock.clone());
        let k = Fingerprint::from("k");
        cache
            .put(&k, CacheEntry::new(json!("A"), Some(Duration::from_secs(60)), clock.now()))
            .unwrap();
        clock.advance(Duration::from_secs(59));
        assert!(cache.get(&k).unwrap().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get(&k).unwrap().is_none());
        assert_eq!(cache.lock().len(), 0);
    }

    #[test]
    fn test_hits_are_recorded_on_entry() {
        let clock = Arc::new(ManualClock::new(10.0));
        let cache = MemoryCache::new(4).unwrap().with_clock(clock.clone());
        let k = Fingerprint::from("k");
        cache.put(&k, CacheEntry::new(json!(1), None, 10.0)).unwrap();
        clock.advance(Duration::from_secs(2));
        cache.get(&k).unwrap();
        let seen = cache.get(&k).unwrap().unwrap();
        assert_eq!(seen.hit_count(), 2);
        assert_eq!(seen.last_accessed(), 12.0);
    }

    #[test]
    fn test_purge_expired_counts_removed() {
        let clock = Arc::new(ManualClock::new(0.0));
        let cache = MemoryCache::new(8).unwrap().with_clock(clock.clone());
        cache.put(&"short".into(), CacheEntry::new(json!(1), Some(Duration::from_secs(1)), 0.0)).unwrap();
        cache.put(&"long".into(), CacheEntry::new(json!(2), Some(Duration::from_secs(100)), 0.0)).unwrap();
        cache.put(&"forever".into(), CacheEntry::new(json!(3), None, 0.0)).unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.len().unwrap(), 2);
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.lock().len(), 2);
    }
}

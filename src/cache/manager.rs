//! Prompt cache facade.

use super::backend::CacheBackend;
use super::entry::CacheEntry;
use super::events::{CacheEvent, CacheEventSink, CacheOutcome, TracingEventSink};
use super::flight::{self, FlightGuard, InFlight, Role};
use super::key::Fingerprint;
use crate::{Error, ErrorContext, Result};
use futures::{Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// TTL for entries stored without an override. `None` stores entries that never expire.
    pub default_ttl: Option<Duration>,
    /// Serialized payloads larger than this are returned to the caller but not stored.
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Some(Duration::from_secs(3600)),
            max_entry_size: 10 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }
    pub fn without_ttl(mut self) -> Self {
        self.default_ttl = None;
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub sets: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Memoizes expensive prompt computations behind a [`CacheBackend`].
///
/// Backend failures never fail a request: they are logged, counted in
/// [`CacheStats::errors`], and the call proceeds as a miss. Compute failures propagate
/// unchanged and are never stored.
pub struct PromptCache {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    inflight: InFlight,
    stats: AtomicStats,
    sink: Arc<dyn CacheEventSink>,
}

impl PromptCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            config,
            backend,
            inflight: InFlight::new(),
            stats: AtomicStats::default(),
            sink: Arc::new(TracingEventSink),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn CacheEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    /// Number of fingerprints currently being computed.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Return the cached value for `fingerprint`, or run `compute`, cache and return its result.
    ///
    /// Concurrent callers for the same fingerprint share a single `compute` run and all observe
    /// its outcome. `ttl` overrides the configured default for a freshly stored entry.
    /// Backends that block on I/O are driven from tokio's blocking pool.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        if !self.config.enabled {
            let result = compute().await;
            self.emit(fingerprint, CacheOutcome::Bypass, started, |ev| {
                ev.with_succeeded(result.is_ok())
            });
            return result;
        }
        let found = self.read_async(fingerprint).await;
        if let Some(value) = self.hit(fingerprint, found, started) {
            return Ok(value);
        }

        match self.inflight.join_or_lead(fingerprint.as_str()) {
            Role::Waiter(rx) => {
                AtomicStats::bump(&self.stats.misses);
                let outcome = flight::wait(rx, fingerprint.as_str()).await;
                self.joined(fingerprint, outcome, started)
            }
            Role::Leader(guard) => {
                let found = self.read_async(fingerprint).await;
                let guard = match self.recheck(fingerprint, guard, found, started) {
                    Ok(value) => return Ok(value),
                    Err(guard) => guard,
                };
                AtomicStats::bump(&self.stats.misses);
                let compute_started = Instant::now();
                let outcome = with_payload(compute().await);
                let latency = compute_started.elapsed();
                let stored = match &outcome {
                    Ok((_, payload)) => Some(
                        self.write_async(fingerprint, payload.clone(), ttl, Some(latency))
                            .await,
                    ),
                    Err(_) => None,
                };
                self.settle(fingerprint, guard, outcome, stored, latency, started)
            }
        }
    }

    /// Thread-blocking variant of [`get_or_compute`](Self::get_or_compute).
    ///
    /// Backend calls run on the calling thread. Joining callers block only on the completion
    /// of this fingerprint. Must not be called from an async runtime worker thread.
    pub fn get_or_compute_blocking<T, F>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let started = Instant::now();
        if !self.config.enabled {
            let result = compute();
            self.emit(fingerprint, CacheOutcome::Bypass, started, |ev| {
                ev.with_succeeded(result.is_ok())
            });
            return result;
        }
        if let Some(value) = self.hit(fingerprint, self.read(fingerprint), started) {
            return Ok(value);
        }

        match self.inflight.join_or_lead(fingerprint.as_str()) {
            Role::Waiter(rx) => {
                AtomicStats::bump(&self.stats.misses);
                let outcome = flight::wait_blocking(rx, fingerprint.as_str());
                self.joined(fingerprint, outcome, started)
            }
            Role::Leader(guard) => {
                let found = self.read(fingerprint);
                let guard = match self.recheck(fingerprint, guard, found, started) {
                    Ok(value) => return Ok(value),
                    Err(guard) => guard,
                };
                AtomicStats::bump(&self.stats.misses);
                let compute_started = Instant::now();
                let outcome = with_payload(compute());
                let latency = compute_started.elapsed();
                let stored = match &outcome {
                    Ok((_, payload)) => {
                        Some(self.write(fingerprint, payload.clone(), ttl, Some(latency)))
                    }
                    Err(_) => None,
                };
                self.settle(fingerprint, guard, outcome, stored, latency, started)
            }
        }
    }

    /// Cache a streamed text response.
    ///
    /// `open` starts the stream; chunks are concatenated and the assembled text is stored only
    /// once the stream ends without error. A chunk error aborts the call, stores nothing and
    /// is returned to every joined caller. Hits return the complete text.
    pub async fn get_or_compute_stream<F, Fut, S>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Option<Duration>,
        open: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
        S: Stream<Item = Result<String>>,
    {
        self.get_or_compute(fingerprint, ttl, || async move {
            let stream = open().await?;
            futures::pin_mut!(stream);
            let mut text = String::new();
            while let Some(chunk) = stream.next().await {
                text.push_str(&chunk?);
            }
            Ok::<String, Error>(text)
        })
        .await
    }

    /// Look up a live entry without computing. Disabled caches always miss.
    pub fn get<T: DeserializeOwned>(&self, fingerprint: &Fingerprint) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        self.read(fingerprint).map(|(value, _)| value)
    }

    /// Store a value directly. Unlike `get_or_compute`, backend failures are returned.
    pub fn put<T: Serialize>(
        &self,
        fingerprint: &Fingerprint,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let payload = encode(value)?;
        self.write(fingerprint, payload, ttl, None)
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.backend.delete(fingerprint)
    }

    pub fn clear(&self) -> Result<()> {
        self.backend.clear()
    }

    /// Run a backend operation off the async worker when the backend blocks on I/O.
    async fn offload<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn CacheBackend) -> Result<R> + Send + 'static,
    {
        if !self.backend.blocks_on_io() {
            return op(&*self.backend);
        }
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || op(&*backend))
            .await
            .map_err(|e| {
                Error::runtime_with_context(
                    format!("cache backend task failed: {}", e),
                    ErrorContext::new()
                        .with_details(self.backend.name())
                        .with_source("prompt_cache"),
                )
            })?
    }

    fn read<T: DeserializeOwned>(&self, fingerprint: &Fingerprint) -> Option<(T, CacheEntry)> {
        match self.decode(fingerprint, self.backend.get(fingerprint)) {
            Decoded::Found(value, entry) => Some((value, entry)),
            Decoded::Absent => None,
            Decoded::Undecodable => {
                self.purged(fingerprint, self.backend.delete(fingerprint));
                None
            }
        }
    }

    async fn read_async<T: DeserializeOwned>(
        &self,
        fingerprint: &Fingerprint,
    ) -> Option<(T, CacheEntry)> {
        let key = fingerprint.clone();
        let got = self.offload(move |backend| backend.get(&key)).await;
        match self.decode(fingerprint, got) {
            Decoded::Found(value, entry) => Some((value, entry)),
            Decoded::Absent => None,
            Decoded::Undecodable => {
                let key = fingerprint.clone();
                let deleted = self.offload(move |backend| backend.delete(&key)).await;
                self.purged(fingerprint, deleted);
                None
            }
        }
    }

    fn decode<T: DeserializeOwned>(
        &self,
        fingerprint: &Fingerprint,
        got: Result<Option<CacheEntry>>,
    ) -> Decoded<T> {
        let entry = match got {
            Ok(Some(entry)) => entry,
            Ok(None) => return Decoded::Absent,
            Err(e) => {
                AtomicStats::bump(&self.stats.errors);
                warn!(fingerprint = %fingerprint, backend = self.backend.name(), error = %e, "cache read failed, treating as miss");
                return Decoded::Absent;
            }
        };
        match serde_json::from_value::<T>(entry.payload().clone()) {
            Ok(value) => Decoded::Found(value, entry),
            Err(e) => {
                AtomicStats::bump(&self.stats.errors);
                warn!(fingerprint = %fingerprint, error = %e, "cached payload does not decode, purging");
                Decoded::Undecodable
            }
        }
    }

    fn purged(&self, fingerprint: &Fingerprint, result: Result<()>) {
        if let Err(e) = result {
            warn!(fingerprint = %fingerprint, error = %e, "failed to purge undecodable entry");
        }
    }

    fn hit<T>(
        &self,
        fingerprint: &Fingerprint,
        found: Option<(T, CacheEntry)>,
        started: Instant,
    ) -> Option<T> {
        let (value, entry) = found?;
        AtomicStats::bump(&self.stats.hits);
        debug!(fingerprint = %fingerprint, hit_count = entry.hit_count(), "cache hit");
        self.emit(fingerprint, CacheOutcome::Hit, started, |ev| {
            ev.with_time_saved(entry.compute_time())
        });
        Some(value)
    }

    /// A leader re-reads once after registering: another leader may have stored the entry
    /// and deregistered between our miss and our registration.
    fn recheck<'a, T>(
        &self,
        fingerprint: &Fingerprint,
        guard: FlightGuard<'a>,
        found: Option<(T, CacheEntry)>,
        started: Instant,
    ) -> std::result::Result<T, FlightGuard<'a>> {
        match found {
            Some((value, entry)) => {
                AtomicStats::bump(&self.stats.hits);
                let saved = entry.compute_time();
                guard.complete(Ok(entry.into_payload()));
                self.emit(fingerprint, CacheOutcome::Hit, started, |ev| ev.with_time_saved(saved));
                Ok(value)
            }
            None => Err(guard),
        }
    }

    /// Publish the leader's outcome. `stored` is the result of the backend write, if one
    /// was attempted.
    fn settle<T>(
        &self,
        fingerprint: &Fingerprint,
        guard: FlightGuard<'_>,
        outcome: Result<(T, Value)>,
        stored: Option<Result<()>>,
        latency: Duration,
        started: Instant,
    ) -> Result<T> {
        if let Some(Err(e)) = stored {
            warn!(fingerprint = %fingerprint, backend = self.backend.name(), error = %e, "cache write failed, result not cached");
        }
        let settled = match outcome {
            Ok((value, payload)) => {
                guard.complete(Ok(payload));
                Ok(value)
            }
            Err(e) => {
                debug!(fingerprint = %fingerprint, error = %e, "compute failed, nothing cached");
                guard.complete(Err(e.clone()));
                Err(e)
            }
        };
        self.emit(fingerprint, CacheOutcome::Miss, started, |ev| {
            ev.with_compute_latency(latency).with_succeeded(settled.is_ok())
        });
        settled
    }

    fn joined<T: DeserializeOwned>(
        &self,
        fingerprint: &Fingerprint,
        outcome: flight::Outcome,
        started: Instant,
    ) -> Result<T> {
        AtomicStats::bump(&self.stats.coalesced);
        let result = outcome.and_then(|payload| {
            serde_json::from_value(payload).map_err(|e| {
                Error::configuration_with_context(
                    format!("joined result does not decode into the requested type: {}", e),
                    ErrorContext::new()
                        .with_details(fingerprint.to_string())
                        .with_source("prompt_cache"),
                )
            })
        });
        self.emit(fingerprint, CacheOutcome::Coalesced, started, |ev| {
            ev.with_succeeded(result.is_ok())
        });
        result
    }

    fn write(
        &self,
        fingerprint: &Fingerprint,
        payload: Value,
        ttl: Option<Duration>,
        latency: Option<Duration>,
    ) -> Result<()> {
        match self.prepare(fingerprint, payload, ttl, latency) {
            Some(entry) => self.count_write(self.backend.put(fingerprint, entry)),
            None => Ok(()),
        }
    }

    async fn write_async(
        &self,
        fingerprint: &Fingerprint,
        payload: Value,
        ttl: Option<Duration>,
        latency: Option<Duration>,
    ) -> Result<()> {
        match self.prepare(fingerprint, payload, ttl, latency) {
            Some(entry) => {
                let key = fingerprint.clone();
                let put = self.offload(move |backend| backend.put(&key, entry)).await;
                self.count_write(put)
            }
            None => Ok(()),
        }
    }

    /// Build the entry to store, or `None` when the payload exceeds `max_entry_size`.
    fn prepare(
        &self,
        fingerprint: &Fingerprint,
        payload: Value,
        ttl: Option<Duration>,
        latency: Option<Duration>,
    ) -> Option<CacheEntry> {
        let size = payload.to_string().len();
        if size > self.config.max_entry_size {
            debug!(fingerprint = %fingerprint, size, limit = self.config.max_entry_size, "payload too large to cache");
            return None;
        }
        let now = self.backend.clock().now();
        let entry = CacheEntry::new(payload, ttl.or(self.config.default_ttl), now);
        Some(match latency {
            Some(latency) => entry.with_compute_time(latency),
            None => entry,
        })
    }

    fn count_write(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => AtomicStats::bump(&self.stats.sets),
            Err(_) => AtomicStats::bump(&self.stats.errors),
        }
        result
    }

    fn emit(
        &self,
        fingerprint: &Fingerprint,
        outcome: CacheOutcome,
        started: Instant,
        decorate: impl FnOnce(CacheEvent) -> CacheEvent,
    ) {
        let event = CacheEvent::new(fingerprint.as_str(), outcome, self.backend.name())
            .with_elapsed(started.elapsed());
        self.sink.record(&decorate(event));
    }
}

enum Decoded<T> {
    Found(T, CacheEntry),
    Absent,
    Undecodable,
}

/// Pair a computed value with its JSON payload; a value that does not serialize fails the call.
fn with_payload<T: Serialize>(result: Result<T>) -> Result<(T, Value)> {
    result.and_then(|value| encode(&value).map(|payload| (value, payload)))
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| {
        Error::configuration_with_context(
            format!("computed value is not serializable: {}", e),
            ErrorContext::new().with_source("prompt_cache"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryCache;
    use crate::cache::clock::{unix_now, ManualClock};
    use crate::cache::events::InMemoryEventSink;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread::ThreadId;

    /// Memory-backed store that records which thread ran each operation and can hide a
    /// number of upcoming reads.
    struct ScriptedBackend {
        inner: MemoryCache,
        blocking: bool,
        hidden_reads: AtomicUsize,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl ScriptedBackend {
        fn new(blocking: bool) -> Self {
            Self {
                inner: MemoryCache::new(16).unwrap(),
                blocking,
                hidden_reads: AtomicUsize::new(0),
                threads: Mutex::new(Vec::new()),
            }
        }
        fn note_thread(&self) {
            self.threads.lock().unwrap().push(std::thread::current().id());
        }
        fn threads(&self) -> Vec<ThreadId> {
            self.threads.lock().unwrap().clone()
        }
    }

    impl CacheBackend for ScriptedBackend {
        fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
            self.note_thread();
            let hide = self
                .hidden_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if hide {
                return Ok(None);
            }
            self.inner.get(key)
        }
        fn put(&self, key: &Fingerprint, entry: CacheEntry) -> Result<()> {
            self.note_thread();
            self.inner.put(key, entry)
        }
        fn delete(&self, key: &Fingerprint) -> Result<()> {
            self.note_thread();
            self.inner.delete(key)
        }
        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }
        fn len(&self) -> Result<usize> {
            self.inner.len()
        }
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn blocks_on_io(&self) -> bool {
            self.blocking
        }
    }

    fn memory_cache(clock: Arc<ManualClock>) -> (PromptCache, Arc<MemoryCache>) {
        let backend = Arc::new(MemoryCache::new(16).unwrap().with_clock(clock));
        let cache = PromptCache::new(backend.clone(), CacheConfig::default());
        (cache, backend)
    }

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let (cache, _) = memory_cache(Arc::new(ManualClock::new(0.0)));
        let calls = AtomicUsize::new(0);
        let k = Fingerprint::from("k1");
        for _ in 0..3 {
            let v: String = cache
                .get_or_compute(&k, None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("A".to_string())
                })
                .await
                .unwrap();
            assert_eq!(v, "A");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (2, 1, 1));
        assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ttl_override_wins_over_default() {
        let clock = Arc::new(ManualClock::new(0.0));
        let (cache, backend) = memory_cache(clock.clone());
        let k = Fingerprint::from("k");
        let _: u32 = cache.get_or_compute(&k, Some(Duration::from_secs(5)), || async { Ok(1) }).await.unwrap();
        assert_eq!(backend.get(&k).unwrap().unwrap().ttl(), Some(Duration::from_secs(5)));
        clock.advance(Duration::from_secs(5));
        let v: u32 = cache.get_or_compute(&k, None, || async { Ok(2) }).await.unwrap();
        assert_eq!(v, 2);
        assert_eq!(backend.get(&k).unwrap().unwrap().ttl(), Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_compute_failure_is_not_cached() {
        let (cache, backend) = memory_cache(Arc::new(ManualClock::new(0.0)));
        let k = Fingerprint::from("k");
        let err = cache
            .get_or_compute::<String, _, _>(&k, None, || async { Err(Error::compute_msg("rate limited")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Compute(_)));
        assert!(backend.get(&k).unwrap().is_none());
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_disabled_bypasses_backend() {
        let backend = Arc::new(MemoryCache::new(4).unwrap());
        let sink = Arc::new(InMemoryEventSink::default());
        let cache = PromptCache::new(backend.clone(), CacheConfig::new().with_enabled(false))
            .with_event_sink(sink.clone());
        let k = Fingerprint::from("k");
        backend.put(&k, CacheEntry::new(serde_json::json!("stale"), None, 0.0)).unwrap();

        let v: String = cache.get_or_compute(&k, None, || async { Ok("fresh".to_string()) }).await.unwrap();
        assert_eq!(v, "fresh");
        assert_eq!(backend.get(&k).unwrap().unwrap().payload(), &serde_json::json!("stale"));
        assert_eq!(sink.count(CacheOutcome::Bypass), 1);
        assert!(cache.get::<String>(&k).is_none());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[tokio::test]
    async fn test_undecodable_hit_is_purged_and_recomputed() {
        let (cache, backend) = memory_cache(Arc::new(ManualClock::new(0.0)));
        let k = Fingerprint::from("k");
        backend.put(&k, CacheEntry::new(serde_json::json!({"not": "a number"}), None, 0.0)).unwrap();
        let v: u64 = cache.get_or_compute(&k, None, || async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
        assert_eq!(cache.stats().errors, 1);
        assert_eq!(backend.get(&k).unwrap().unwrap().payload(), &serde_json::json!(7));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_returned_but_not_stored() {
        let backend = Arc::new(MemoryCache::new(4).unwrap());
        let cache = PromptCache::new(backend.clone(), CacheConfig::new().with_max_entry_size(8));
        let k = Fingerprint::from("k");
        let v: String = cache
            .get_or_compute(&k, None, || async { Ok("a fairly long completion".to_string()) })
            .await
            .unwrap();
        assert_eq!(v, "a fairly long completion");
        assert!(backend.get(&k).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_report_hit_and_miss() {
        let backend = Arc::new(MemoryCache::new(4).unwrap());
        let sink = Arc::new(InMemoryEventSink::default());
        let cache = PromptCache::new(backend, CacheConfig::default()).with_event_sink(sink.clone());
        let k = Fingerprint::from("k");
        for _ in 0..2 {
            let _: i32 = cache
                .get_or_compute(&k, None, || async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(1)
                })
                .await
                .unwrap();
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, CacheOutcome::Miss);
        assert!(events[0].compute_latency.unwrap() >= Duration::from_millis(20));
        assert_eq!(events[1].outcome, CacheOutcome::Hit);
        assert!(events[1].time_saved.unwrap() >= Duration::from_millis(20));
        assert!(events.iter().all(|e| e.backend == "memory" && e.fingerprint == "k"));
    }

    #[tokio::test]
    async fn test_stream_cached_only_when_complete() {
        let (cache, backend) = memory_cache(Arc::new(ManualClock::new(0.0)));
        let k = Fingerprint::from("stream");

        let err = cache
            .get_or_compute_stream(&k, None, || async {
                Ok(futures::stream::iter(vec![
                    Ok("Hel".to_string()),
                    Err(Error::compute_msg("connection reset")),
                ]))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Compute(_)));
        assert!(backend.get(&k).unwrap().is_none());

        let text = cache
            .get_or_compute_stream(&k, None, || async {
                Ok(futures::stream::iter(vec![Ok("Hello".to_string()), Ok(" World".to_string())]))
            })
            .await
            .unwrap();
        assert_eq!(text, "Hello World");

        let cached = cache
            .get_or_compute_stream(&k, None, || async {
                Ok(futures::stream::iter(Vec::<Result<String>>::new()))
            })
            .await
            .unwrap();
        assert_eq!(cached, "Hello World");
    }

    #[test]
    fn test_blocking_path_shares_entries_with_async_path() {
        let (cache, _) = memory_cache(Arc::new(ManualClock::new(0.0)));
        let k = Fingerprint::from("k");
        let v: String = cache.get_or_compute_blocking(&k, None, || Ok("A".to_string())).unwrap();
        assert_eq!(v, "A");
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let again: String = rt
            .block_on(cache.get_or_compute(&k, None, || async { Ok("B".to_string()) }))
            .unwrap();
        assert_eq!(again, "A");
    }

    #[tokio::test]
    async fn test_blocking_backend_runs_off_the_runtime_thread() {
        let backend = Arc::new(ScriptedBackend::new(true));
        let cache = PromptCache::new(backend.clone(), CacheConfig::default());
        let k = Fingerprint::from("k");
        for _ in 0..2 {
            let v: String = cache.get_or_compute(&k, None, || async { Ok("A".to_string()) }).await.unwrap();
            assert_eq!(v, "A");
        }
        let runtime_thread = std::thread::current().id();
        let threads = backend.threads();
        // miss read, leader re-read, write, then one hit read
        assert_eq!(threads.len(), 4);
        assert!(threads.iter().all(|t| *t != runtime_thread));
        assert_eq!(cache.stats().sets, 1);
    }

    #[test]
    fn test_blocking_entry_point_keeps_backend_calls_inline() {
        let backend = Arc::new(ScriptedBackend::new(true));
        let cache = PromptCache::new(backend.clone(), CacheConfig::default());
        let v: u32 = cache.get_or_compute_blocking(&Fingerprint::from("k"), None, || Ok(3)).unwrap();
        assert_eq!(v, 3);
        let caller = std::thread::current().id();
        assert!(!backend.threads().is_empty());
        assert!(backend.threads().iter().all(|t| *t == caller));
    }

    #[tokio::test]
    async fn test_leader_recheck_hit_counts_as_hit() {
        let backend = Arc::new(ScriptedBackend::new(false));
        let sink = Arc::new(InMemoryEventSink::default());
        let cache = PromptCache::new(backend.clone(), CacheConfig::default()).with_event_sink(sink.clone());
        let k = Fingerprint::from("k");
        backend.put(&k, CacheEntry::new(serde_json::json!("stored elsewhere"), None, unix_now())).unwrap();
        // the first read misses, as if another leader stored the entry just afterwards
        backend.hidden_reads.store(1, Ordering::SeqCst);

        let calls = AtomicUsize::new(0);
        let v: String = cache
            .get_or_compute(&k, None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("recomputed".to_string())
            })
            .await
            .unwrap();
        assert_eq!(v, "stored elsewhere");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 0, 0));
        assert_eq!(sink.count(CacheOutcome::Hit), 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[test]
    fn test_put_get_invalidate() {
        let (cache, _) = memory_cache(Arc::new(ManualClock::new(0.0)));
        let k = Fingerprint::from("k");
        cache.put(&k, &vec![1, 2, 3], None).unwrap();
        assert_eq!(cache.get::<Vec<i32>>(&k), Some(vec![1, 2, 3]));
        cache.invalidate(&k).unwrap();
        assert_eq!(cache.get::<Vec<i32>>(&k), None);
    }
}

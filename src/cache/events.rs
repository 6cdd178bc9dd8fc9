//! Hit/miss events for the tracing collaborator.
//!
//! Every `get_or_compute` call produces exactly one [`CacheEvent`]. Sinks are called inline,
//! so implementations must return promptly; [`ChannelEventSink`] hands events to another task
//! without ever blocking.

use super::clock::unix_now;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Live entry found; compute skipped.
    Hit,
    /// No live entry; this caller ran compute.
    Miss,
    /// No live entry; this caller joined another caller's computation.
    Coalesced,
    /// Cache disabled; compute ran without touching the backend.
    Bypass,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Coalesced => "coalesced",
            CacheOutcome::Bypass => "bypass",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent {
    pub fingerprint: String,
    pub outcome: CacheOutcome,
    pub backend: &'static str,
    /// Wall time the caller spent inside `get_or_compute`.
    pub elapsed: Duration,
    /// On hits: how long the original computation took.
    pub time_saved: Option<Duration>,
    /// On misses: how long compute took.
    pub compute_latency: Option<Duration>,
    /// Whether the call produced a value (a failed compute still emits an event).
    pub succeeded: bool,
    pub timestamp: f64,
}

impl CacheEvent {
    pub fn new(fingerprint: impl Into<String>, outcome: CacheOutcome, backend: &'static str) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            outcome,
            backend,
            elapsed: Duration::ZERO,
            time_saved: None,
            compute_latency: None,
            succeeded: true,
            timestamp: unix_now(),
        }
    }
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
    pub fn with_time_saved(mut self, saved: Option<Duration>) -> Self {
        self.time_saved = saved;
        self
    }
    pub fn with_compute_latency(mut self, latency: Duration) -> Self {
        self.compute_latency = Some(latency);
        self
    }
    pub fn with_succeeded(mut self, ok: bool) -> Self {
        self.succeeded = ok;
        self
    }
}

/// Destination for cache events.
pub trait CacheEventSink: Send + Sync {
    fn record(&self, event: &CacheEvent);
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl CacheEventSink for NoopEventSink {
    fn record(&self, _event: &CacheEvent) {}
}

/// Emits each event as a `tracing` debug event under the `flowprompt::cache` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl CacheEventSink for TracingEventSink {
    fn record(&self, event: &CacheEvent) {
        tracing::debug!(
            target: "flowprompt::cache",
            fingerprint = %event.fingerprint,
            outcome = event.outcome.as_str(),
            backend = event.backend,
            elapsed_ms = event.elapsed.as_millis() as u64,
            time_saved_ms = event.time_saved.map(|d| d.as_millis() as u64),
            compute_ms = event.compute_latency.map(|d| d.as_millis() as u64),
            succeeded = event.succeeded,
            "prompt cache lookup"
        );
    }
}

/// In-memory sink for testing.
pub struct InMemoryEventSink {
    events: RwLock<Vec<CacheEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events: max,
        }
    }
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
    pub fn count(&self, outcome: CacheOutcome) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.outcome == outcome)
            .count()
    }
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl CacheEventSink for InMemoryEventSink {
    fn record(&self, event: &CacheEvent) {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.push(event.clone());
        if events.len() > self.max_events {
            events.remove(0);
        }
    }
}

/// Forwards events over an unbounded channel to whichever task records spans.
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<CacheEvent>,
}

impl ChannelEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CacheEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CacheEventSink for ChannelEventSink {
    fn record(&self, event: &CacheEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Fan out to several sinks.
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn CacheEventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }
    pub fn add_sink(mut self, sink: Arc<dyn CacheEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl CacheEventSink for CompositeEventSink {
    fn record(&self, event: &CacheEvent) {
        for s in &self.sinks {
            s.record(event);
        }
    }
}

//! Prompt response caching: memoize expensive model calls behind pluggable backends.
//!
//! # Prompt Cache Module
//!
//! A caller renders a prompt, derives a [`Fingerprint`] for it, and asks the cache for a result,
//! handing over a compute operation that performs the real model call. Live hits return the
//! stored payload; misses run compute once (concurrent identical requests are coalesced),
//! store the result with a TTL and return it.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`PromptCache`] | Facade: TTL, single-flight coalescing, compute-on-miss, statistics |
//! | [`CacheBackend`] | Trait for storage strategies |
//! | [`MemoryCache`] | Bounded in-process LRU backend |
//! | [`FileCache`] | Durable one-file-per-entry backend |
//! | [`CacheEntry`] | Stored payload plus creation time, TTL and access statistics |
//! | [`KeyDeriver`] | Canonical fingerprint derivation |
//! | [`configure_cache`] / [`get_cache`] | Process-wide instance |
//!
//! ## Example
//!
//! ```rust,no_run
//! use flowprompt::cache::{configure_cache, derive_fingerprint, get_cache, CacheOptions};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> flowprompt::Result<()> {
//! configure_cache(CacheOptions::new().enabled(true).default_ttl(Duration::from_secs(3600)))?;
//! let cache = get_cache();
//!
//! let fp = derive_fingerprint("extract_user", &json!({"text": "John is 25"}), "gpt-4o", &json!({"temperature": 0.0}))?;
//! let answer: String = cache
//!     .get_or_compute(&fp, None, || async { Ok("John, 25".to_string()) })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Storage faults never fail a request; they are logged and the call degrades to a miss.

mod backend;
mod clock;
mod config;
mod entry;
mod events;
mod file;
mod flight;
mod key;
mod manager;

pub use backend::{CacheBackend, MemoryCache};
pub use clock::{unix_now, Clock, ManualClock, SystemClock};
pub use config::{
    cache_settings, configure_cache, get_cache, reset_cache, BackendChoice, BackendKind,
    CacheOptions, CacheSettings, DEFAULT_DIRECTORY, DEFAULT_MAX_SIZE, DEFAULT_TTL, ENV_BACKEND,
    ENV_DIR, ENV_ENABLED, ENV_MAX_SIZE, ENV_TTL_SECS,
};
pub use entry::CacheEntry;
pub use events::{
    CacheEvent, CacheEventSink, CacheOutcome, ChannelEventSink, CompositeEventSink,
    InMemoryEventSink, NoopEventSink, TracingEventSink,
};
pub use file::{FileCache, FileCacheReport};
pub use key::{derive_fingerprint, Fingerprint, KeyDeriver};
pub use manager::{CacheConfig, CacheStats, PromptCache};

//! # flowprompt
//!
//! Response caching for typed LLM prompt calls.
//!
//! ## Overview
//!
//! Model invocations are slow and billed per token. This crate memoizes their results keyed
//! on prompt identity, rendered inputs, model and call parameters, so a repeated request is
//! answered from a cache instead of the provider.
//!
//! ## Key Features
//!
//! - **Deterministic keys**: [`cache::derive_fingerprint`] canonicalizes inputs before hashing
//! - **Pluggable storage**: in-process LRU ([`cache::MemoryCache`]) or durable files
//!   ([`cache::FileCache`]), or any [`cache::CacheBackend`]
//! - **Time-based expiry**: per-entry TTL with a configurable default
//! - **Single-flight**: concurrent identical requests share one computation, from async or
//!   blocking callers
//! - **Graceful degradation**: storage failures fall back to computing
//! - **Observability**: every lookup emits a [`cache::CacheEvent`] and a `tracing` event
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowprompt::{configure_cache, get_cache, CacheOptions, Fingerprint};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> flowprompt::Result<()> {
//!     configure_cache(CacheOptions::new().default_ttl(Duration::from_secs(3600)))?;
//!
//!     let cache = get_cache();
//!     let reply: String = cache
//!         .get_or_compute(&Fingerprint::from("k1"), None, || async {
//!             // call the model provider here
//!             Ok("A".to_string())
//!         })
//!         .await?;
//!     assert_eq!(reply, "A");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Backends, key derivation, the `PromptCache` facade and global configuration |
//! | [`error`] | Error taxonomy |

pub mod cache;

pub use cache::{
    configure_cache, get_cache, reset_cache, CacheBackend, CacheEntry, CacheOptions, FileCache,
    Fingerprint, MemoryCache, PromptCache,
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};

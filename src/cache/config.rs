//! Process-wide cache configuration.
//!
//! One [`PromptCache`] per process, built lazily from [`CacheSettings`] on the first
//! [`get_cache`] call and replaced atomically by [`configure_cache`]. Callers that already hold
//! an `Arc<PromptCache>` keep using it; reconfiguration only affects later `get_cache` calls.

use super::backend::{CacheBackend, MemoryCache};
use super::file::FileCache;
use super::manager::{CacheConfig, PromptCache};
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwapOption;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_MAX_SIZE: usize = 1000;
pub const DEFAULT_DIRECTORY: &str = ".flowprompt_cache";

pub const ENV_ENABLED: &str = "FLOWPROMPT_CACHE_ENABLED";
pub const ENV_BACKEND: &str = "FLOWPROMPT_CACHE_BACKEND";
pub const ENV_TTL_SECS: &str = "FLOWPROMPT_CACHE_TTL_SECS";
pub const ENV_MAX_SIZE: &str = "FLOWPROMPT_CACHE_MAX_SIZE";
pub const ENV_DIR: &str = "FLOWPROMPT_CACHE_DIR";

/// Built-in backend kinds, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    File,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "file" => Ok(BackendKind::File),
            other => Err(Error::configuration_with_context(
                format!("unknown cache backend '{}' (expected 'memory' or 'file')", other),
                ErrorContext::new()
                    .with_field_path("backend")
                    .with_source("cache_config"),
            )),
        }
    }
}

/// Which backend the global cache uses.
#[derive(Clone)]
pub enum BackendChoice {
    Memory,
    File,
    Custom(Arc<dyn CacheBackend>),
}

impl std::fmt::Debug for BackendChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendChoice::Memory => f.write_str("Memory"),
            BackendChoice::File => f.write_str("File"),
            BackendChoice::Custom(b) => write!(f, "Custom({})", b.name()),
        }
    }
}

impl From<BackendKind> for BackendChoice {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Memory => BackendChoice::Memory,
            BackendKind::File => BackendChoice::File,
        }
    }
}

/// Partial configuration. Unset options keep their previous value.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub enabled: Option<bool>,
    pub backend: Option<BackendChoice>,
    /// `Some(None)` clears the default TTL so entries never expire by time.
    pub default_ttl: Option<Option<Duration>>,
    pub max_size: Option<usize>,
    pub directory: Option<PathBuf>,
}

/// Serialized form accepted by [`CacheOptions::from_yaml_str`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    enabled: Option<bool>,
    backend: Option<BackendKind>,
    default_ttl_secs: Option<u64>,
    max_size: Option<usize>,
    directory: Option<PathBuf>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }
    pub fn backend(mut self, backend: impl Into<BackendChoice>) -> Self {
        self.backend = Some(backend.into());
        self
    }
    pub fn custom_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(BackendChoice::Custom(backend));
        self
    }
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(Some(ttl));
        self
    }
    pub fn no_default_ttl(mut self) -> Self {
        self.default_ttl = Some(None);
        self
    }
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    /// Read options from `FLOWPROMPT_CACHE_*` environment variables. Unset variables stay unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut opts = Self::new();
        if let Some(v) = lookup(ENV_ENABLED) {
            opts.enabled = Some(parse_bool(ENV_ENABLED, &v)?);
        }
        if let Some(v) = lookup(ENV_BACKEND) {
            opts.backend = Some(v.parse::<BackendKind>()?.into());
        }
        if let Some(v) = lookup(ENV_TTL_SECS) {
            let secs: u64 = parse_number(ENV_TTL_SECS, &v)?;
            opts.default_ttl = Some(Some(Duration::from_secs(secs)));
        }
        if let Some(v) = lookup(ENV_MAX_SIZE) {
            opts.max_size = Some(parse_number(ENV_MAX_SIZE, &v)?);
        }
        if let Some(v) = lookup(ENV_DIR) {
            opts.directory = Some(PathBuf::from(v));
        }
        Ok(opts)
    }

    /// Parse options from YAML, e.g. a `cache:` section of an application config file.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: RawOptions = serde_yaml::from_str(yaml).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid cache configuration: {}", e),
                ErrorContext::new().with_source("cache_config"),
            )
        })?;
        Ok(Self {
            enabled: raw.enabled,
            backend: raw.backend.map(BackendChoice::from),
            default_ttl: raw.default_ttl_secs.map(|s| Some(Duration::from_secs(s))),
            max_size: raw.max_size,
            directory: raw.directory,
        })
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration_with_context(
            format!("expected a boolean, got '{}'", value),
            ErrorContext::new().with_field_path(var).with_source("cache_config"),
        )),
    }
}

fn parse_number<N: FromStr>(var: &str, value: &str) -> Result<N> {
    value.trim().parse().map_err(|_| {
        Error::configuration_with_context(
            format!("expected a non-negative integer, got '{}'", value),
            ErrorContext::new().with_field_path(var).with_source("cache_config"),
        )
    })
}

/// Complete configuration of the global cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: BackendChoice,
    pub default_ttl: Option<Duration>,
    /// Capacity of the memory backend; ignored by other backends.
    pub max_size: usize,
    /// Root of the file backend; ignored by other backends.
    pub directory: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendChoice::Memory,
            default_ttl: Some(DEFAULT_TTL),
            max_size: DEFAULT_MAX_SIZE,
            directory: PathBuf::from(DEFAULT_DIRECTORY),
        }
    }
}

impl CacheSettings {
    pub fn apply(&mut self, options: CacheOptions) {
        if let Some(enabled) = options.enabled {
            self.enabled = enabled;
        }
        if let Some(backend) = options.backend {
            self.backend = backend;
        }
        if let Some(ttl) = options.default_ttl {
            self.default_ttl = ttl;
        }
        if let Some(max_size) = options.max_size {
            self.max_size = max_size;
        }
        if let Some(dir) = options.directory {
            self.directory = dir;
        }
    }

    /// Validate and construct the cache these settings describe.
    ///
    /// `max_size` is only checked when the memory backend is selected.
    pub fn build(&self) -> Result<PromptCache> {
        let backend: Arc<dyn CacheBackend> = match &self.backend {
            BackendChoice::Memory => Arc::new(MemoryCache::new(self.max_size)?),
            BackendChoice::File => Arc::new(FileCache::new(self.directory.clone())?),
            BackendChoice::Custom(b) => Arc::clone(b),
        };
        let mut config = CacheConfig::new().with_enabled(self.enabled);
        config.default_ttl = self.default_ttl;
        Ok(PromptCache::new(backend, config))
    }
}

struct GlobalCache {
    settings: Mutex<CacheSettings>,
    instance: ArcSwapOption<PromptCache>,
}

static GLOBAL: Lazy<GlobalCache> = Lazy::new(|| GlobalCache {
    settings: Mutex::new(CacheSettings::default()),
    instance: ArcSwapOption::empty(),
});

/// Merge `options` into the current settings and install a freshly built cache.
///
/// Invalid options fail immediately and leave the previous configuration in place.
pub fn configure_cache(options: CacheOptions) -> Result<()> {
    let mut settings = GLOBAL.settings.lock().unwrap_or_else(PoisonError::into_inner);
    let mut next = settings.clone();
    next.apply(options);
    let cache = next.build()?;
    info!(
        enabled = next.enabled,
        backend = cache.backend_name(),
        default_ttl_secs = next.default_ttl.map(|d| d.as_secs()),
        "prompt cache configured"
    );
    *settings = next;
    GLOBAL.instance.store(Some(Arc::new(cache)));
    Ok(())
}

/// The process-wide cache, created from the current settings on first use.
pub fn get_cache() -> Arc<PromptCache> {
    if let Some(cache) = GLOBAL.instance.load_full() {
        return cache;
    }
    let settings = GLOBAL.settings.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(cache) = GLOBAL.instance.load_full() {
        return cache;
    }
    let cache = Arc::new(settings.build().unwrap_or_else(|e| {
        error!(error = %e, "prompt cache settings invalid, falling back to a disabled cache");
        fallback_cache()
    }));
    GLOBAL.instance.store(Some(Arc::clone(&cache)));
    cache
}

/// Drop the global instance and restore default settings.
pub fn reset_cache() {
    let mut settings = GLOBAL.settings.lock().unwrap_or_else(PoisonError::into_inner);
    *settings = CacheSettings::default();
    GLOBAL.instance.store(None);
}

/// Snapshot of the settings the global cache is (or will be) built from.
pub fn cache_settings() -> CacheSettings {
    GLOBAL
        .settings
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn fallback_cache() -> PromptCache {
    let capacity = NonZeroUsize::MIN;
    PromptCache::new(
        Arc::new(MemoryCache::with_capacity(capacity)),
        CacheConfig::new().with_enabled(false),
    )
}

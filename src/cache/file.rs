//! Durable file-per-entry backend.
//!
//! Layout: `<dir>/<sha256(fingerprint)>.json`, each holding one serialized [`CacheEntry`].
//! Writes go to a uniquely named temp file in the same directory and are renamed into place,
//! so readers never observe a partial record and concurrent writers resolve last-writer-wins.

use super::backend::CacheBackend;
use super::clock::{Clock, SystemClock};
use super::entry::CacheEntry;
use super::key::{sha256_hex, Fingerprint};
use crate::{Error, ErrorContext, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const RECORD_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";

/// Summary of a cache directory, produced by [`FileCache::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCacheReport {
    pub live: usize,
    pub expired: usize,
    pub corrupt: usize,
    pub total_bytes: u64,
}

pub struct FileCache {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot create cache directory: {}", e),
                ErrorContext::new()
                    .with_field_path("directory")
                    .with_details(dir.display().to_string())
                    .with_source("file_cache"),
            )
        })?;
        Ok(Self {
            dir,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `key`. The hash keeps names filesystem-safe and bounded.
    pub fn path_for(&self, key: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sha256_hex(key.as_str().as_bytes()), RECORD_EXT))
    }

    /// Read a record without expiry checks or self-healing.
    pub fn peek(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        match read_record(&path)? {
            Some(Ok(entry)) => Ok(Some(entry)),
            Some(Err(e)) => Err(backend_error(format!("corrupt cache record: {}", e), &path)),
            None => Ok(None),
        }
    }

    /// Classify every record in the directory.
    pub fn scan(&self) -> Result<FileCacheReport> {
        let now = self.clock.now();
        let mut report = FileCacheReport::default();
        for path in self.record_paths()? {
            if let Ok(meta) = fs::metadata(&path) {
                report.total_bytes += meta.len();
            }
            match read_record(&path) {
                Ok(Some(Ok(entry))) if entry.is_expired(now) => report.expired += 1,
                Ok(Some(Ok(_))) => report.live += 1,
                Ok(Some(Err(_))) => report.corrupt += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable cache record");
                    report.corrupt += 1;
                }
            }
        }
        Ok(report)
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>> {
        self.paths_with_ext(RECORD_EXT)
    }

    fn paths_with_ext(&self, ext: &str) -> Result<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(backend_error(e.to_string(), &self.dir)),
        };
        let mut paths = Vec::new();
        for dirent in read_dir {
            let path = dirent.map_err(|e| backend_error(e.to_string(), &self.dir))?.path();
            if path.is_file() && path.extension().and_then(|x| x.to_str()) == Some(ext) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("record");
        let tmp = self.dir.join(format!(
            ".{}.{}.{}",
            stem,
            uuid::Uuid::new_v4().simple(),
            TEMP_EXT
        ));
        let written = fs::File::create(&tmp).and_then(|mut f| {
            f.write_all(bytes)?;
            f.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
            let _ = fs::remove_file(&tmp);
            return Err(backend_error(format!("failed to write cache record: {}", e), path));
        }
        Ok(())
    }
}

impl CacheBackend for FileCache {
    fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        let mut entry = match read_record(&path)? {
            None => return Ok(None),
            Some(Ok(entry)) => entry,
            Some(Err(e)) => {
                warn!(fingerprint = %key, path = %path.display(), error = %e, "discarding corrupt cache record");
                remove_if_present(&path)?;
                return Ok(None);
            }
        };
        let now = self.clock.now();
        if entry.is_expired(now) {
            debug!(fingerprint = %key, "file cache entry expired");
            remove_if_present(&path)?;
            return Ok(None);
        }
        // Access statistics are not written back: a read never rewrites a record.
        entry.touch(now);
        Ok(Some(entry))
    }

    fn put(&self, key: &Fingerprint, entry: CacheEntry) -> Result<()> {
        let path = self.path_for(key);
        let bytes = serde_json::to_vec(&entry).map_err(|e| {
            Error::configuration_with_context(
                format!("cache entry is not serializable: {}", e),
                ErrorContext::new().with_source("file_cache"),
            )
        })?;
        self.write_atomic(&path, &bytes)
    }

    fn delete(&self, key: &Fingerprint) -> Result<()> {
        remove_if_present(&self.path_for(key))
    }

    fn clear(&self) -> Result<()> {
        let mut paths = self.record_paths()?;
        paths.extend(self.paths_with_ext(TEMP_EXT)?);
        for path in paths {
            remove_if_present(&path)?;
        }
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.scan()?.live)
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        for path in self.record_paths()? {
            let stale = match read_record(&path) {
                Ok(Some(Ok(entry))) => entry.is_expired(now),
                Ok(Some(Err(_))) => true,
                Ok(None) => false,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable cache record");
                    false
                }
            };
            if stale {
                remove_if_present(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "file"
    }

    fn blocks_on_io(&self) -> bool {
        true
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

/// `Ok(None)` when the file is missing, `Ok(Some(Err))` when it exists but does not decode.
fn read_record(path: &Path) -> Result<Option<std::result::Result<CacheEntry, serde_json::Error>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(backend_error(format!("failed to read cache record: {}", e), path)),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(backend_error(format!("failed to remove cache record: {}", e), path)),
    }
}

fn backend_error(msg: impl Into<String>, path: &Path) -> Error {
    Error::backend_with_context(
        msg,
        ErrorContext::new()
            .with_details(path.display().to_string())
            .with_source("file_cache"),
    )
}

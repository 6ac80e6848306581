//! Local File Cache
//!
//! Mirrors remote files into an `active` tree on local disk, bounded by a
//! capacity in kilobytes. Loads go through a `temp` scratch directory and are
//! renamed into place. Evicted entries take their files with them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use reqwest::Url;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::cached_file::{data_path_for, is_metadata_file, metadata_path_for, CachedFile};
use super::errors::CacheError;
use super::loader::{active_path, cache_key, RemoteFileLoader};
use crate::webdav::RemoteStore;

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub used_kb: u64,
    pub capacity_kb: u64,
}

/// Local disk cache for remote file content
pub struct LocalFileCache {
    /// Live tree mirroring remote paths
    active_dir: PathBuf,
    /// Scratch area for in-flight downloads
    temp_dir: PathBuf,
    capacity_kb: u64,
    loader: RemoteFileLoader,
    /// Installed entries by decoded path, weighted in kilobytes
    entries: Cache<String, Arc<CachedFile>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LocalFileCache {
    /// Open (or create) a cache rooted at `cache_dir`
    ///
    /// # Arguments
    /// * `cache_dir` - Directory holding the `active` and `temp` trees
    /// * `capacity_kb` - Maximum total size of the active tree in kilobytes
    /// * `store` - Remote tier used to fill misses
    pub fn open(cache_dir: &Path, capacity_kb: u64, store: Arc<dyn RemoteStore>) -> Result<Self> {
        let active_dir = cache_dir.join("active");
        let temp_dir = cache_dir.join("temp");
        for dir in [&active_dir, &temp_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create cache directory: {:?}", dir))?;
        }
        let active_dir = active_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve cache directory: {:?}", active_dir))?;
        let temp_dir = temp_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve cache directory: {:?}", temp_dir))?;

        let eviction_root = active_dir.clone();
        let entries = Cache::builder()
            .name("local_file_cache")
            .max_capacity(capacity_kb)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(|_key: &String, entry: &Arc<CachedFile>| -> u32 {
                u32::try_from(entry.kilobytes().max(1)).unwrap_or(u32::MAX)
            })
            .eviction_listener(move |_key: Arc<String>, entry: Arc<CachedFile>, cause| {
                // Same key, same paths: the replacement owns the files now
                if cause == RemovalCause::Replaced {
                    return;
                }
                debug!(url = %entry.url(), cause = ?cause, "Evicting cached file");
                entry.remove(&eviction_root);
            })
            .build();

        let loader = RemoteFileLoader::new(
            store,
            capacity_kb.saturating_mul(1024),
            active_dir.clone(),
            temp_dir.clone(),
        );

        let cache = Self {
            active_dir,
            temp_dir,
            capacity_kb,
            loader,
            entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };

        cache.cleanup();
        let restored = cache.warm_start();

        info!(
            cache_dir = %cache_dir.display(),
            capacity_mb = capacity_kb / 1024,
            restored = restored,
            "File cache initialized"
        );

        Ok(cache)
    }

    /// Get a cached file, fetching it from the remote tier if not present
    ///
    /// Concurrent requests for the same URL share one load. Entries are
    /// keyed by decoded path, so a URL naming an entry cached from another
    /// origin is refused with `InvalidUrl` instead of being served its bytes.
    pub fn get(&self, url: &Url) -> Result<Arc<CachedFile>, Arc<CacheError>> {
        let key = cache_key(url).map_err(Arc::new)?;

        if let Some(entry) = self.entries.get(&key) {
            same_origin(&entry, url).map_err(Arc::new)?;
            if entry.local_path().exists() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(url = %url, "File cache HIT");
                return Ok(entry);
            }
            warn!(url = %url, path = %entry.local_path().display(), "Cached file vanished, reloading");
            self.entries.invalidate(&key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(url = %url, "File cache MISS");

        let entry = self
            .entries
            .try_get_with(key, || self.loader.load(url).map(Arc::new))?;
        same_origin(&entry, url).map_err(Arc::new)?;
        Ok(entry)
    }

    /// Whether `url` is currently cached
    pub fn contains(&self, url: &Url) -> bool {
        self.lookup(url).is_some()
    }

    /// Drop a cached file; returns whether it was present
    pub fn evict(&self, url: &Url) -> bool {
        let Some((key, _)) = self.lookup(url) else {
            return false;
        };
        self.entries.invalidate(&key);
        info!(url = %url, "Evicted cached file");
        true
    }

    /// Indexed entry for `url`, ignoring entries from another origin
    fn lookup(&self, url: &Url) -> Option<(String, Arc<CachedFile>)> {
        let key = cache_key(url).ok()?;
        let entry = self.entries.get(&key)?;
        same_origin(&entry, url).ok()?;
        Some((key, entry))
    }

    /// Drop every cached file
    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
        info!("Cleared file cache");
    }

    /// Apply pending evictions now instead of on the next write
    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.entry_count(),
            used_kb: self.entries.weighted_size(),
            capacity_kb: self.capacity_kb,
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        self.loader.store()
    }

    /// Get the active directory path
    pub fn active_dir(&self) -> &Path {
        &self.active_dir
    }

    /// Remove downloads left in the temp directory by an earlier run
    fn cleanup(&self) {
        let Ok(read_dir) = fs::read_dir(&self.temp_dir) else {
            return;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            debug!(path = %path.display(), "Removing stale temp file");
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!(path = %path.display(), error = %e, "Failed to remove stale temp file");
            }
        }
    }

    /// Rebuild the index from sidecars in the active tree
    ///
    /// Unreadable sidecars and data files without a sidecar are deleted so
    /// the next request fetches them again.
    fn warm_start(&self) -> usize {
        let files: Vec<PathBuf> = WalkDir::new(&self.active_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        let mut restored = 0;
        for path in &files {
            if is_metadata_file(path) {
                match CachedFile::load_previously_cached(path) {
                    Ok(entry) => match self.restorable(path, &entry) {
                        Ok(key) => {
                            self.entries.insert(key, Arc::new(entry));
                            restored += 1;
                        }
                        Err(reason) => {
                            warn!(
                                sidecar = %path.display(),
                                local = %entry.local_path().display(),
                                reason = %reason,
                                "Cache metadata does not match its location, discarding"
                            );
                            discard_pair(path);
                        }
                    },
                    Err(e) => {
                        warn!(sidecar = %path.display(), error = %e, "Discarding unreadable cache metadata");
                        discard_pair(path);
                    }
                }
            } else if is_stale_write(path) || !metadata_path_for(path).exists() {
                debug!(path = %path.display(), "Removing orphaned cache file");
                match fs::remove_file(path) {
                    Ok(()) => {}
                    // Already taken out together with a corrupt sidecar
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to remove orphaned cache file")
                    }
                }
            }
        }

        // Capacity may have shrunk since the last run
        self.entries.run_pending_tasks();
        restored
    }

    /// Index key for a restored entry whose files sit exactly where a load
    /// of its URL would have put them
    fn restorable(&self, meta_path: &Path, entry: &CachedFile) -> Result<String, String> {
        let expected = active_path(&self.active_dir, entry.url()).map_err(|e| e.to_string())?;
        if entry.local_path() != expected {
            return Err(format!("expected data file at {}", expected.display()));
        }

        let resolved = entry
            .local_path()
            .canonicalize()
            .map_err(|e| e.to_string())?;
        if !resolved.starts_with(&self.active_dir) {
            return Err(format!("data file resolves to {}", resolved.display()));
        }
        if meta_path != metadata_path_for(&resolved) {
            return Err("sidecar is not beside its data file".to_string());
        }

        cache_key(entry.url()).map_err(|e| e.to_string())
    }
}

/// Entries are only shared between URLs of one scheme, host and port
fn same_origin(entry: &CachedFile, url: &Url) -> Result<(), CacheError> {
    if entry.url().origin() == url.origin() {
        return Ok(());
    }
    warn!(url = %url, cached = %entry.url(), "Path already cached from another server");
    Err(CacheError::InvalidUrl(format!(
        "{} maps to the cached file of {}",
        url,
        entry.url()
    )))
}

/// Leftover from an interrupted sidecar write (`tempfile` names them `.tmpXXXXXX`)
fn is_stale_write(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(".tmp"))
        .unwrap_or(false)
}

/// Delete a sidecar and the data file it describes
fn discard_pair(meta_path: &Path) {
    let data_path = data_path_for(meta_path);
    for path in data_path.as_deref().into_iter().chain([meta_path]) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to delete discarded cache file");
            }
        }
    }
}

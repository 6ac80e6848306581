//! Remote Metadata Cache
//!
//! Short-lived cache for WebDAV PROPFIND results using Moka.
//! Uses synchronous cache since lookups happen on blocking worker threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::sync::Cache;
use tracing::{debug, trace};

use crate::webdav::WebDavFile;

/// Default TTL for cached remote metadata
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(30);

/// Metadata cache with TTL support
///
/// Provides separate caches for:
/// - Single resource lookups (Depth 0)
/// - Immediate collection listings (Depth 1)
pub struct MetadataCache {
    /// Resource descriptors by URL
    file_cache: Cache<String, WebDavFile>,
    /// Collection listings by URL
    dir_cache: Cache<String, Vec<WebDavFile>>,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

impl MetadataCache {
    /// Create a new metadata cache with the default TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_METADATA_TTL)
    }

    /// Create a cache whose entries expire after `ttl`
    pub fn with_ttl(ttl: Duration) -> Self {
        let file_cache = Cache::builder()
            .time_to_live(ttl)
            .name("remote_file_cache")
            .build();

        let dir_cache = Cache::builder()
            .time_to_live(ttl)
            .name("remote_listing_cache")
            .build();

        Self {
            file_cache,
            dir_cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a resource descriptor
    pub fn get_file(&self, url: &str) -> Option<WebDavFile> {
        match self.file_cache.get(url) {
            Some(file) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(url = url, "Cache HIT for remote file");
                Some(file)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(url = url, "Cache MISS for remote file");
                None
            }
        }
    }

    pub fn insert_file(&self, url: &str, file: WebDavFile) {
        self.file_cache.insert(url.to_string(), file);
        debug!(url = url, "Cached remote file metadata");
    }

    /// Look up a collection listing
    pub fn get_dir(&self, url: &str) -> Option<Vec<WebDavFile>> {
        match self.dir_cache.get(url) {
            Some(entries) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(url = url, entries = entries.len(), "Cache HIT for listing");
                Some(entries)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(url = url, "Cache MISS for listing");
                None
            }
        }
    }

    /// Store a listing; each child's descriptor is cached as well
    pub fn insert_dir(&self, url: &str, entries: Vec<WebDavFile>) {
        for entry in &entries {
            self.file_cache
                .insert(entry.url.as_str().to_string(), entry.clone());
        }
        debug!(url = url, entries = entries.len(), "Cached remote listing");
        self.dir_cache.insert(url.to_string(), entries);
    }

    /// Invalidate a URL's descriptor and listing
    ///
    /// Call this after writing to the remote resource.
    pub fn invalidate(&self, url: &str) {
        self.file_cache.invalidate(url);
        self.dir_cache.invalidate(url);
        debug!(url = url, "Invalidated remote metadata");
    }

    pub fn clear(&self) {
        self.file_cache.invalidate_all();
        self.dir_cache.invalidate_all();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!("Cleared remote metadata caches");
    }

    /// Get cache statistics
    ///
    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    fn create_test_file(path: &str) -> WebDavFile {
        WebDavFile {
            url: Url::parse(&format!("http://dav.example.org{}", path)).unwrap(),
            is_directory: false,
            etag: Some("\"e1\"".to_string()),
            size_bytes: 1024,
        }
    }

    #[test]
    fn test_cache_hit_miss() {
        let cache = MetadataCache::new();
        let file = create_test_file("/a.txt");
        let key = file.url.as_str().to_string();

        // Initially miss
        assert!(cache.get_file(&key).is_none());
        let (_, _, hit_rate) = cache.stats();
        assert_eq!(hit_rate, 0.0);

        cache.insert_file(&key, file.clone());
        assert_eq!(cache.get_file(&key), Some(file));

        let (hits, misses, hit_rate) = cache.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
        assert!(hit_rate > 49.0 && hit_rate < 51.0);
    }

    #[test]
    fn test_listing_populates_children() {
        let cache = MetadataCache::new();
        let child = create_test_file("/dir/b.txt");
        cache.insert_dir("http://dav.example.org/dir/", vec![child.clone()]);

        assert_eq!(cache.get_dir("http://dav.example.org/dir/").map(|d| d.len()), Some(1));
        assert_eq!(cache.get_file(child.url.as_str()), Some(child));
    }

    #[test]
    fn test_cache_invalidation_and_clear() {
        let cache = MetadataCache::new();
        let file = create_test_file("/a.txt");
        let key = file.url.as_str().to_string();

        cache.insert_file(&key, file);
        cache.invalidate(&key);
        assert!(cache.get_file(&key).is_none());

        cache.insert_dir("http://dav.example.org/", vec![]);
        cache.clear();
        assert!(cache.get_dir("http://dav.example.org/").is_none());
        let (hits, misses, _) = cache.stats();
        assert_eq!(hits, 0);
        assert_eq!(misses, 1);
    }

    #[test]
    fn test_entries_expire() {
        let cache = MetadataCache::with_ttl(Duration::from_millis(50));
        let file = create_test_file("/a.txt");
        let key = file.url.as_str().to_string();
        cache.insert_file(&key, file);
        std::thread::sleep(Duration::from_millis(120));
        assert!(cache.get_file(&key).is_none());
    }
}

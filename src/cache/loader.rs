//! Remote File Loader
//!
//! Fills the cache for one URL: resolves remote metadata, enforces the
//! capacity policy, picks the temp and active paths and installs the file.
//! Single-flight per URL is the caller's job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Url;
use tracing::{debug, warn};

use super::cached_file::CachedFile;
use super::errors::CacheError;
use crate::webdav::RemoteStore;

pub struct RemoteFileLoader {
    store: Arc<dyn RemoteStore>,
    capacity_bytes: u64,
    active_dir: PathBuf,
    temp_dir: PathBuf,
}

impl RemoteFileLoader {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        capacity_bytes: u64,
        active_dir: PathBuf,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            capacity_bytes,
            active_dir,
            temp_dir,
        }
    }

    /// Fetch `url` into the active tree
    pub fn load(&self, url: &Url) -> Result<CachedFile, CacheError> {
        let local_path = active_path(&self.active_dir, url)?;
        let remote = self.store.find_file(url)?;

        if remote.size_bytes >= self.capacity_bytes {
            warn!(
                url = %url,
                size = remote.size_bytes,
                capacity = self.capacity_bytes,
                "Remote file does not fit in cache"
            );
            return Err(CacheError::CapacityExceeded {
                url: url.to_string(),
                size_bytes: remote.size_bytes,
                capacity_bytes: self.capacity_bytes,
            });
        }

        let temp_file = self.temp_dir.join(temp_file_name(url));

        debug!(
            url = %url,
            local = %local_path.display(),
            temp = %temp_file.display(),
            "Loading remote file into cache"
        );

        let mut entry = CachedFile::new(remote, local_path);
        entry.load(self.store.as_ref(), &temp_file, self.capacity_bytes)?;
        Ok(entry)
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }
}

/// Flat, filesystem-safe scratch name for a URL: its path with `/` replaced
pub fn temp_file_name(url: &Url) -> String {
    url.path().replace('/', "_")
}

/// Location under `active_dir` mirroring the decoded URL path
pub fn active_path(active_dir: &Path, url: &Url) -> Result<PathBuf, CacheError> {
    let mut path = active_dir.to_path_buf();
    for segment in decoded_segments(url)? {
        path.push(segment);
    }
    Ok(path)
}

/// Index key for a URL: its decoded path segments joined by `/`
///
/// Spellings of the same path (`%78.txt` and `x.txt`) share one key, the
/// same way they share one file on disk.
pub fn cache_key(url: &Url) -> Result<String, CacheError> {
    Ok(decoded_segments(url)?.join("/"))
}

/// Percent-decoded path segments, each safe to use as a file name
///
/// Queries and fragments are rejected since they have no place on disk.
fn decoded_segments(url: &Url) -> Result<Vec<String>, CacheError> {
    let invalid = || CacheError::InvalidUrl(url.to_string());

    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid());
    }

    let mut decoded = Vec::new();
    for segment in url.path_segments().ok_or_else(invalid)? {
        let segment = urlencoding::decode(segment).map_err(|_| invalid())?;
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains('/')
            || segment.contains('\\')
            || segment.contains('\0')
        {
            return Err(invalid());
        }
        decoded.push(segment.into_owned());
    }

    if decoded.is_empty() {
        return Err(invalid());
    }
    Ok(decoded)
}

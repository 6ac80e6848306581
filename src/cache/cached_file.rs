//! Cached File
//!
//! One remote file mirrored on local disk: the data file under the active
//! tree plus a hidden metadata sidecar next to it.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::errors::CacheError;
use super::legacy::{self, JavaValue};
use crate::webdav::{RemoteStore, WebDavFile};

/// Suffix of the sidecar file stored beside each cached file
pub const METADATA_SUFFIX: &str = ".jacs-cached-file";

/// Buffer size for streaming remote content to disk
const COPY_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Sidecar contents (current JSON format)
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    url: String,
    #[serde(default)]
    etag: Option<String>,
    local_path: PathBuf,
    #[serde(default)]
    size_bytes: Option<u64>,
}

/// Sidecar contents as written by the Java client (object stream)
#[derive(Debug)]
struct LegacySidecar {
    remote_url: String,
    etag: Option<String>,
    local_path: PathBuf,
}

impl LegacySidecar {
    fn parse(bytes: &[u8]) -> Result<Self, String> {
        let JavaValue::Object(record) = legacy::read_object(bytes).map_err(|e| e.to_string())?
        else {
            return Err("legacy stream does not hold an object".to_string());
        };

        let remote_url = record
            .field("remoteUrl")
            .or_else(|| record.field("url"))
            .and_then(JavaValue::as_text)
            .ok_or_else(|| format!("{} has no remote URL", record.class_name))?;
        let local_path = record
            .field("localPath")
            .or_else(|| record.field("localFile"))
            .and_then(JavaValue::as_text)
            .ok_or_else(|| format!("{} has no local path", record.class_name))?;
        let etag = record.field("etag").and_then(JavaValue::as_text);

        Ok(Self {
            remote_url,
            etag,
            local_path: PathBuf::from(local_path),
        })
    }
}

/// Path of the sidecar for a data file: `.<filename>.jacs-cached-file`
pub fn metadata_path_for(local_path: &Path) -> PathBuf {
    let name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    local_path.with_file_name(format!(".{}{}", name, METADATA_SUFFIX))
}

/// Data file described by a sidecar path (inverse of [`metadata_path_for`])
pub fn data_path_for(meta_path: &Path) -> Option<PathBuf> {
    let name = meta_path.file_name()?.to_str()?;
    let data_name = name.strip_prefix('.')?.strip_suffix(METADATA_SUFFIX)?;
    if data_name.is_empty() {
        return None;
    }
    Some(meta_path.with_file_name(data_name))
}

/// Whether `path` names a sidecar file
pub fn is_metadata_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(METADATA_SUFFIX))
        .unwrap_or(false)
}

/// A remote file and its place in the local cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    remote: WebDavFile,
    local_path: PathBuf,
    /// Absent for directory descriptors
    meta_path: Option<PathBuf>,
}

impl CachedFile {
    pub fn new(remote: WebDavFile, local_path: PathBuf) -> Self {
        let meta_path = if remote.is_directory {
            None
        } else {
            Some(metadata_path_for(&local_path))
        };
        Self {
            remote,
            local_path,
            meta_path,
        }
    }

    pub fn remote(&self) -> &WebDavFile {
        &self.remote
    }

    pub fn url(&self) -> &Url {
        &self.remote.url
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn meta_path(&self) -> Option<&Path> {
        self.meta_path.as_deref()
    }

    pub fn kilobytes(&self) -> u64 {
        self.remote.kilobytes()
    }

    /// Fetch the remote content and install it at the local path
    ///
    /// Content is streamed into `temp_file` and renamed into place, so the
    /// active tree only ever sees the complete file. The sidecar is written
    /// after a successful rename. On any failure the temp file is removed.
    ///
    /// The transfer stops with `CapacityExceeded` once `limit_bytes` have
    /// arrived, whatever size the server declared. The entry is then sized
    /// by the bytes actually copied.
    pub fn load(
        &mut self,
        store: &dyn RemoteStore,
        temp_file: &Path,
        limit_bytes: u64,
    ) -> Result<(), CacheError> {
        if self.remote.is_directory {
            return Err(CacheError::NotAFile(self.remote.url.to_string()));
        }

        debug!(url = %self.remote.url, temp = %temp_file.display(), "Fetching remote file");

        let copied = match self.copy_to(store, temp_file, limit_bytes) {
            Ok(copied) => copied,
            Err(e) => {
                discard(temp_file);
                return Err(e);
            }
        };

        if copied != self.remote.size_bytes {
            warn!(
                url = %self.remote.url,
                expected = self.remote.size_bytes,
                copied = copied,
                "Transferred size differs from remote metadata"
            );
            self.remote.size_bytes = copied;
        }

        if let Some(parent) = self.local_path.parent() {
            if let Err(source) = fs::create_dir_all(parent) {
                discard(temp_file);
                return Err(CacheError::Install {
                    path: parent.to_path_buf(),
                    source,
                });
            }
        }

        if let Err(source) = fs::rename(temp_file, &self.local_path) {
            discard(temp_file);
            return Err(CacheError::Install {
                path: self.local_path.clone(),
                source,
            });
        }

        if let Err(e) = self.save_metadata() {
            // A data file without its sidecar is an orphan
            discard(&self.local_path);
            return Err(e);
        }

        info!(
            url = %self.remote.url,
            local = %self.local_path.display(),
            size = copied,
            "Installed file in cache"
        );
        Ok(())
    }

    fn copy_to(
        &self,
        store: &dyn RemoteStore,
        temp_file: &Path,
        limit_bytes: u64,
    ) -> Result<u64, CacheError> {
        let mut input = store.open_stream(&self.remote)?;
        let mut output = File::create(temp_file).map_err(|e| self.transfer_error(e))?;

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.transfer_error(e)),
            };
            output
                .write_all(&buffer[..n])
                .map_err(|e| self.transfer_error(e))?;
            total += n as u64;
            if total >= limit_bytes {
                return Err(CacheError::CapacityExceeded {
                    url: self.remote.url.to_string(),
                    size_bytes: total,
                    capacity_bytes: limit_bytes,
                });
            }
        }
        output.sync_all().map_err(|e| self.transfer_error(e))?;

        Ok(total)
    }

    fn transfer_error(&self, source: std::io::Error) -> CacheError {
        CacheError::Transfer {
            url: self.remote.url.to_string(),
            source,
        }
    }

    /// Delete the data file and sidecar, then prune empty ancestors
    ///
    /// Errors are logged, never returned.
    /// Directories are pruned up to, but never including, `active_root`.
    /// Nothing is deleted unless the entry lies strictly inside `active_root`.
    pub fn remove(&self, active_root: &Path) {
        if self.local_path.parent().is_some_and(|dir| !dir.exists()) {
            debug!(url = %self.remote.url, "Cached file already gone");
            return;
        }
        if !is_inside(&self.local_path, active_root) {
            warn!(
                url = %self.remote.url,
                path = %self.local_path.display(),
                root = %active_root.display(),
                "Refusing to delete a file outside the cache"
            );
            return;
        }

        if self.remote.is_directory {
            if let Err(e) = fs::remove_dir(&self.local_path) {
                if e.kind() != ErrorKind::NotFound {
                    debug!(path = %self.local_path.display(), error = %e, "Directory placeholder not removed");
                }
            }
        } else {
            remove_quietly(&self.local_path);
        }
        if let Some(meta_path) = &self.meta_path {
            remove_quietly(meta_path);
        }
        if let Some(parent) = self.local_path.parent() {
            prune_empty_dirs(parent, active_root);
        }
        debug!(url = %self.remote.url, "Removed cached file");
    }

    /// Write the sidecar in the current format
    fn save_metadata(&self) -> Result<(), CacheError> {
        let Some(meta_path) = &self.meta_path else {
            return Ok(());
        };

        let sidecar = Sidecar {
            url: self.remote.url.to_string(),
            etag: self.remote.etag.clone(),
            local_path: self.local_path.clone(),
            size_bytes: Some(self.remote.size_bytes),
        };
        let json = serde_json::to_vec_pretty(&sidecar).map_err(|e| CacheError::Metadata {
            path: meta_path.clone(),
            reason: e.to_string(),
        })?;

        write_atomically(meta_path, &json)
    }

    /// Rebuild an entry from its sidecar
    ///
    /// Reads the JSON format, falling back to the legacy binary format. A
    /// legacy sidecar is rewritten as JSON once it has been read.
    pub fn load_previously_cached(meta_file: &Path) -> Result<Self, CacheError> {
        let metadata_error = |reason: String| CacheError::Metadata {
            path: meta_file.to_path_buf(),
            reason,
        };

        let bytes = fs::read(meta_file).map_err(|e| metadata_error(e.to_string()))?;

        if let Ok(sidecar) = serde_json::from_slice::<Sidecar>(&bytes) {
            return Self::from_parts(
                meta_file,
                &sidecar.url,
                sidecar.etag,
                sidecar.local_path,
                sidecar.size_bytes,
            );
        }

        let legacy = LegacySidecar::parse(&bytes)
            .map_err(|e| metadata_error(format!("not JSON and not legacy format: {}", e)))?;
        let entry = Self::from_parts(
            meta_file,
            &legacy.remote_url,
            legacy.etag,
            legacy.local_path,
            None,
        )?;

        match entry.save_metadata() {
            Ok(()) => info!(path = %meta_file.display(), "Upgraded legacy cache metadata"),
            Err(e) => warn!(path = %meta_file.display(), error = %e, "Failed to upgrade legacy cache metadata"),
        }
        Ok(entry)
    }

    fn from_parts(
        meta_file: &Path,
        url: &str,
        etag: Option<String>,
        local_path: PathBuf,
        size_bytes: Option<u64>,
    ) -> Result<Self, CacheError> {
        let metadata_error = |reason: String| CacheError::Metadata {
            path: meta_file.to_path_buf(),
            reason,
        };

        let url = Url::parse(url).map_err(|e| metadata_error(format!("bad url {}: {}", url, e)))?;
        let on_disk = fs::metadata(&local_path)
            .map_err(|e| metadata_error(format!("data file {}: {}", local_path.display(), e)))?;

        let remote = WebDavFile {
            url,
            is_directory: false,
            etag,
            size_bytes: size_bytes.unwrap_or(on_disk.len()),
        };
        Ok(Self::new(remote, local_path))
    }
}

/// Write `data` to `path` via a temp sibling and rename
fn write_atomically(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    let install_error = |source: std::io::Error| CacheError::Install {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(install_error)?;
    tmp.write_all(data).map_err(install_error)?;
    tmp.persist(path).map_err(|e| install_error(e.error))?;
    Ok(())
}

/// Whether `path` resolves to somewhere strictly below `root`
///
/// The file itself may be gone, so its parent is resolved instead.
pub fn is_inside(path: &Path, root: &Path) -> bool {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return false;
    };
    match (parent.canonicalize(), root.canonicalize()) {
        (Ok(parent), Ok(root)) => {
            let resolved = parent.join(name);
            resolved != root && resolved.starts_with(&root)
        }
        _ => false,
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete partial file");
        }
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Deleted"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete cached file"),
    }
}

/// Remove `start` and its ancestors while they are empty and strictly inside `active_root`
fn prune_empty_dirs(start: &Path, active_root: &Path) {
    let root = match active_root.canonicalize() {
        Ok(root) => root,
        Err(e) => {
            warn!(root = %active_root.display(), error = %e, "Cannot resolve cache root");
            return;
        }
    };

    let mut dir = start.to_path_buf();
    loop {
        let Ok(canonical) = dir.canonicalize() else {
            break;
        };
        if canonical == root || !canonical.starts_with(&root) {
            break;
        }

        let is_empty = match fs::read_dir(&canonical) {
            Ok(mut entries) => entries.next().is_none(),
            Err(e) => {
                warn!(dir = %canonical.display(), error = %e, "Failed to inspect cache directory");
                break;
            }
        };
        if !is_empty {
            break;
        }
        if let Err(e) = fs::remove_dir(&canonical) {
            warn!(dir = %canonical.display(), error = %e, "Failed to remove empty cache directory");
            break;
        }
        debug!(dir = %canonical.display(), "Removed empty cache directory");

        match canonical.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::legacy::tests::legacy_record;
    use crate::webdav::WebDavError;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const NO_LIMIT: u64 = u64::MAX;

    /// In-memory remote tier keyed by URL
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        files: Mutex<HashMap<String, Vec<u8>>>,
        pub(crate) opened: AtomicUsize,
        pub(crate) lookups: AtomicUsize,
    }

    impl MemoryStore {
        pub(crate) fn with_file(self, url: &str, content: Vec<u8>) -> Self {
            self.files
                .lock()
                .unwrap()
                .insert(url.to_string(), content);
            self
        }
    }

    impl RemoteStore for MemoryStore {
        fn find_file(&self, url: &Url) -> Result<WebDavFile, WebDavError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let files = self.files.lock().unwrap();
            if let Some(content) = files.get(url.as_str()) {
                return Ok(WebDavFile {
                    url: url.clone(),
                    is_directory: false,
                    etag: Some(format!("\"{}\"", content.len())),
                    size_bytes: content.len() as u64,
                });
            }
            let prefix = format!("{}/", url.as_str().trim_end_matches('/'));
            if files.keys().any(|k| k.starts_with(&prefix)) {
                return Ok(WebDavFile {
                    url: url.clone(),
                    is_directory: true,
                    etag: None,
                    size_bytes: 0,
                });
            }
            Err(WebDavError::NotFound(url.to_string()))
        }

        fn find_immediate_internal_files(&self, url: &Url) -> Result<Vec<WebDavFile>, WebDavError> {
            let prefix = format!("{}/", url.as_str().trim_end_matches('/'));
            let files = self.files.lock().unwrap();
            let mut children: Vec<String> = files
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .map(|rest| match rest.find('/') {
                    Some(i) => format!("{}{}/", prefix, &rest[..i]),
                    None => format!("{}{}", prefix, rest),
                })
                .collect();
            children.sort();
            children.dedup();
            drop(files);
            children
                .iter()
                .map(|c| self.find_file(&Url::parse(c).unwrap()))
                .collect()
        }

        fn create_directory(&self, _url: &Url) -> Result<(), WebDavError> {
            Ok(())
        }

        fn save_file(&self, url: &Url, file: &Path) -> Result<(), WebDavError> {
            let content = fs::read(file)?;
            self.files
                .lock()
                .unwrap()
                .insert(url.to_string(), content);
            Ok(())
        }

        fn open_stream(&self, file: &WebDavFile) -> Result<Box<dyn Read + Send>, WebDavError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let content = self
                .files
                .lock()
                .unwrap()
                .get(file.url.as_str())
                .cloned()
                .ok_or_else(|| WebDavError::NotFound(file.url.to_string()))?;
            Ok(Box::new(Cursor::new(content)))
        }
    }

    /// Store whose stream fails after the first chunk
    struct BrokenStore;

    struct BrokenReader {
        served: bool,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.served {
                return Err(std::io::Error::new(ErrorKind::ConnectionReset, "reset"));
            }
            self.served = true;
            let n = buf.len().min(16);
            buf[..n].fill(1);
            Ok(n)
        }
    }

    impl RemoteStore for BrokenStore {
        fn find_file(&self, url: &Url) -> Result<WebDavFile, WebDavError> {
            Err(WebDavError::NotFound(url.to_string()))
        }
        fn find_immediate_internal_files(&self, _url: &Url) -> Result<Vec<WebDavFile>, WebDavError> {
            Ok(Vec::new())
        }
        fn create_directory(&self, _url: &Url) -> Result<(), WebDavError> {
            Ok(())
        }
        fn save_file(&self, _url: &Url, _file: &Path) -> Result<(), WebDavError> {
            Ok(())
        }
        fn open_stream(&self, _file: &WebDavFile) -> Result<Box<dyn Read + Send>, WebDavError> {
            Ok(Box::new(BrokenReader { served: false }))
        }
    }

    fn remote(url: &str, size: u64) -> WebDavFile {
        WebDavFile {
            url: Url::parse(url).unwrap(),
            is_directory: false,
            etag: Some("\"e\"".to_string()),
            size_bytes: size,
        }
    }

    fn dirs() -> (TempDir, PathBuf, PathBuf) {
        let root = TempDir::new().unwrap();
        let active = root.path().join("active");
        let temp = root.path().join("temp");
        fs::create_dir_all(&active).unwrap();
        fs::create_dir_all(&temp).unwrap();
        (root, active, temp)
    }

    #[test]
    fn test_metadata_path_naming() {
        let meta = metadata_path_for(Path::new("/cache/active/data/x.txt"));
        assert_eq!(meta, PathBuf::from("/cache/active/data/.x.txt.jacs-cached-file"));
        assert!(is_metadata_file(&meta));
        assert_eq!(data_path_for(&meta), Some(PathBuf::from("/cache/active/data/x.txt")));
        assert!(!is_metadata_file(Path::new("/cache/active/data/x.txt")));
    }

    #[test]
    fn test_directory_has_no_sidecar() {
        let mut dir = remote("http://h/data/", 0);
        dir.is_directory = true;
        let entry = CachedFile::new(dir, PathBuf::from("/cache/active/data"));
        assert!(entry.meta_path().is_none());
    }

    #[test]
    fn test_load_installs_file_and_sidecar() {
        let (_root, active, temp) = dirs();
        let store = MemoryStore::default().with_file("http://h/data/x.txt", vec![b'a'; 1200]);
        let mut entry = CachedFile::new(remote("http://h/data/x.txt", 1200), active.join("data/x.txt"));
        let temp_file = temp.join("_data_x.txt");

        entry.load(&store, &temp_file, NO_LIMIT).unwrap();

        assert_eq!(fs::metadata(entry.local_path()).unwrap().len(), 1200);
        assert!(active.join("data/.x.txt.jacs-cached-file").exists());
        assert!(!temp_file.exists());
        assert_eq!(fs::read_dir(&temp).unwrap().count(), 0);
    }

    #[test]
    fn test_load_rejects_directory() {
        let (_root, active, temp) = dirs();
        let store = MemoryStore::default();
        let mut dir = remote("http://h/data/", 0);
        dir.is_directory = true;
        let mut entry = CachedFile::new(dir, active.join("data"));

        let err = entry.load(&store, &temp.join("_data_"), NO_LIMIT).unwrap_err();
        assert!(matches!(err, CacheError::NotAFile(_)));
        assert_eq!(store.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_transfer_failure_leaves_nothing_behind() {
        let (_root, active, temp) = dirs();
        let mut entry = CachedFile::new(remote("http://h/data/x.txt", 100), active.join("data/x.txt"));

        let err = entry.load(&BrokenStore, &temp.join("_data_x.txt"), NO_LIMIT).unwrap_err();
        assert!(matches!(err, CacheError::Transfer { .. }));
        assert_eq!(fs::read_dir(&temp).unwrap().count(), 0);
        assert_eq!(fs::read_dir(&active).unwrap().count(), 0);
    }

    #[test]
    fn test_install_failure_cleans_temp_file() {
        let (_root, active, temp) = dirs();
        let store = MemoryStore::default().with_file("http://h/data/x.txt", vec![1; 10]);
        // A non-empty directory squatting on the target makes the rename fail
        let target = active.join("data/x.txt");
        fs::create_dir_all(target.join("occupied")).unwrap();
        let mut entry = CachedFile::new(remote("http://h/data/x.txt", 10), target);

        let err = entry.load(&store, &temp.join("_data_x.txt"), NO_LIMIT).unwrap_err();
        assert!(matches!(err, CacheError::Install { .. }));
        assert_eq!(fs::read_dir(&temp).unwrap().count(), 0);
        assert!(!active.join("data/.x.txt.jacs-cached-file").exists());
    }

    #[test]
    fn test_sidecar_round_trip() {
        let (_root, active, temp) = dirs();
        let store = MemoryStore::default().with_file("http://h/data/x.txt", vec![9; 64]);
        let mut entry = CachedFile::new(remote("http://h/data/x.txt", 64), active.join("data/x.txt"));
        entry.load(&store, &temp.join("_data_x.txt"), NO_LIMIT).unwrap();

        let meta = entry.meta_path().unwrap();
        let reloaded = CachedFile::load_previously_cached(meta).unwrap();
        assert_eq!(reloaded.url(), entry.url());
        assert_eq!(reloaded.local_path(), entry.local_path());
        assert_eq!(reloaded, entry);
    }

    #[test]
    fn test_legacy_sidecar_is_read_and_upgraded() {
        let (_root, active, _temp) = dirs();
        let local = active.join("data/x.txt");
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(&local, vec![3u8; 300]).unwrap();

        let meta = metadata_path_for(&local);
        let record = legacy_record(
            "http://h/data/x.txt",
            Some("\"old\""),
            &local.to_string_lossy(),
            false,
        );
        assert_eq!(&record[..4], &[0xAC, 0xED, 0x00, 0x05]);
        fs::write(&meta, record).unwrap();

        let entry = CachedFile::load_previously_cached(&meta).unwrap();
        assert_eq!(entry.url().as_str(), "http://h/data/x.txt");
        assert_eq!(entry.remote().etag.as_deref(), Some("\"old\""));
        assert_eq!(entry.remote().size_bytes, 300);
        assert_eq!(entry.local_path(), local.as_path());

        // Rewritten as JSON with the same logical content
        let upgraded: Sidecar = serde_json::from_slice(&fs::read(&meta).unwrap()).unwrap();
        assert_eq!(upgraded.url, "http://h/data/x.txt");
        assert_eq!(upgraded.etag.as_deref(), Some("\"old\""));
        assert_eq!(upgraded.local_path, local);

        let again = CachedFile::load_previously_cached(&meta).unwrap();
        assert_eq!(again, entry);
    }

    #[test]
    fn test_legacy_sidecar_with_file_object_path() {
        let (_root, active, _temp) = dirs();
        let local = active.join("x.txt");
        fs::write(&local, b"abc").unwrap();

        let meta = metadata_path_for(&local);
        fs::write(
            &meta,
            legacy_record("http://h/x.txt", None, &local.to_string_lossy(), true),
        )
        .unwrap();

        let entry = CachedFile::load_previously_cached(&meta).unwrap();
        assert_eq!(entry.local_path(), local.as_path());
        assert_eq!(entry.remote().etag, None);
        assert_eq!(entry.remote().size_bytes, 3);
    }

    #[test]
    fn test_corrupt_sidecar_is_metadata_error() {
        let (_root, active, _temp) = dirs();
        let meta = active.join(".x.txt.jacs-cached-file");
        fs::write(&meta, b"\x00\xffgarbage").unwrap();

        let err = CachedFile::load_previously_cached(&meta).unwrap_err();
        assert!(matches!(err, CacheError::Metadata { .. }));
    }

    #[test]
    fn test_remove_prunes_empty_ancestors_only() {
        let (_root, active, temp) = dirs();
        let store = MemoryStore::default()
            .with_file("http://h/a/b/c/x.txt", vec![1; 8])
            .with_file("http://h/a/keep.txt", vec![2; 8]);

        let mut doomed = CachedFile::new(remote("http://h/a/b/c/x.txt", 8), active.join("a/b/c/x.txt"));
        let mut kept = CachedFile::new(remote("http://h/a/keep.txt", 8), active.join("a/keep.txt"));
        doomed.load(&store, &temp.join("_a_b_c_x.txt"), NO_LIMIT).unwrap();
        kept.load(&store, &temp.join("_a_keep.txt"), NO_LIMIT).unwrap();

        doomed.remove(&active);

        assert!(!active.join("a/b/c/x.txt").exists());
        assert!(!active.join("a/b/c/.x.txt.jacs-cached-file").exists());
        assert!(!active.join("a/b").exists());
        assert!(active.join("a/keep.txt").exists());
        assert!(active.exists());

        kept.remove(&active);
        assert!(!active.join("a").exists());
        assert!(active.exists());
    }

    #[test]
    fn test_copy_stops_at_limit_whatever_size_was_declared() {
        let (_root, active, temp) = dirs();
        let store = MemoryStore::default().with_file("http://h/big.bin", vec![7; 4096]);
        // The server claimed an empty file
        let mut entry = CachedFile::new(remote("http://h/big.bin", 0), active.join("big.bin"));

        let err = entry.load(&store, &temp.join("_big.bin"), 1024).unwrap_err();
        assert!(matches!(
            err,
            CacheError::CapacityExceeded { capacity_bytes: 1024, .. }
        ));
        assert_eq!(fs::read_dir(&temp).unwrap().count(), 0);
        assert_eq!(fs::read_dir(&active).unwrap().count(), 0);
    }

    #[test]
    fn test_entry_is_sized_by_copied_bytes() {
        let (_root, active, temp) = dirs();
        let store = MemoryStore::default().with_file("http://h/x.txt", vec![5; 64]);
        let mut entry = CachedFile::new(remote("http://h/x.txt", 100_000), active.join("x.txt"));

        entry.load(&store, &temp.join("_x.txt"), NO_LIMIT).unwrap();

        assert_eq!(entry.remote().size_bytes, 64);
        assert_eq!(entry.kilobytes(), 1);
        let sidecar: Sidecar =
            serde_json::from_slice(&fs::read(entry.meta_path().unwrap()).unwrap()).unwrap();
        assert_eq!(sidecar.size_bytes, Some(64));
    }

    #[test]
    fn test_remove_refuses_paths_outside_root() {
        let (root, active, _temp) = dirs();
        let victim = root.path().join("victim.txt");
        fs::write(&victim, b"keep me").unwrap();

        let escaped = CachedFile::new(remote("http://h/evil", 7), active.join("../victim.txt"));
        escaped.remove(&active);

        assert!(victim.exists());
        assert!(!is_inside(&active.join("../victim.txt"), &active));
        assert!(!is_inside(&active, &active));
        assert!(is_inside(&active.join("x.txt"), &active));
    }

    #[test]
    fn test_remove_missing_files_is_quiet() {
        let (_root, active, _temp) = dirs();
        let entry = CachedFile::new(remote("http://h/gone.txt", 1), active.join("gone.txt"));
        entry.remove(&active);
        assert!(active.exists());
    }
}

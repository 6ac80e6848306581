//! Remote store seam
//!
//! The cache only needs "metadata for URL" and "bytes for URL" from the
//! remote tier. `RemoteStore` is that contract; `WebDavClient` implements it
//! against a real server and tests implement it in memory.

use std::io::Read;
use std::path::Path;

use reqwest::Url;
use tokio::runtime::Handle;

use super::errors::WebDavError;
use super::types::WebDavFile;

/// Blocking view of the remote file tier.
///
/// Called from background threads (never from inside an async task).
pub trait RemoteStore: Send + Sync {
    /// Metadata for a single resource
    fn find_file(&self, url: &Url) -> Result<WebDavFile, WebDavError>;

    /// Whether a resource exists; other errors propagate
    fn is_available(&self, url: &Url) -> Result<bool, WebDavError> {
        match self.find_file(url) {
            Ok(_) => Ok(true),
            Err(WebDavError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Direct children of a collection (the collection itself excluded)
    fn find_immediate_internal_files(&self, url: &Url) -> Result<Vec<WebDavFile>, WebDavError>;

    /// Every file below a collection, at any depth
    fn find_all_internal_files(&self, url: &Url) -> Result<Vec<WebDavFile>, WebDavError> {
        let mut files = Vec::new();
        let mut pending = vec![url.clone()];
        while let Some(dir) = pending.pop() {
            for child in self.find_immediate_internal_files(&dir)? {
                if child.is_directory {
                    pending.push(child.url);
                } else {
                    files.push(child);
                }
            }
        }
        Ok(files)
    }

    /// Create a collection
    fn create_directory(&self, url: &Url) -> Result<(), WebDavError>;

    /// Upload a local file to `url`
    fn save_file(&self, url: &Url, file: &Path) -> Result<(), WebDavError>;

    /// Open the content of a remote file as a byte stream
    fn open_stream(&self, file: &WebDavFile) -> Result<Box<dyn Read + Send>, WebDavError>;

    /// Connection health: "healthy", "degraded" or "unhealthy"
    fn health(&self) -> &'static str {
        "healthy"
    }
}

/// Adapts a streaming `reqwest::Response` to `std::io::Read` by blocking on
/// each chunk through the runtime handle.
pub struct BlockingBody {
    response: reqwest::Response,
    runtime: Handle,
    pending: Vec<u8>,
    offset: usize,
    done: bool,
}

impl BlockingBody {
    pub fn new(response: reqwest::Response, runtime: Handle) -> Self {
        Self {
            response,
            runtime,
            pending: Vec::new(),
            offset: 0,
            done: false,
        }
    }
}

impl Read for BlockingBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.offset >= self.pending.len() {
            if self.done {
                return Ok(0);
            }
            let chunk = self
                .runtime
                .block_on(self.response.chunk())
                .map_err(std::io::Error::other)?;
            match chunk {
                Some(bytes) => {
                    self.pending = bytes.to_vec();
                    self.offset = 0;
                }
                None => self.done = true,
            }
        }

        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

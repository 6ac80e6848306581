//! Cache Error Types

use std::path::PathBuf;

use crate::webdav::WebDavError;

/// Failures of a single cache load, install or sidecar read
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{url} is {size_bytes} bytes, cache capacity is {capacity_bytes} bytes")]
    CapacityExceeded {
        url: String,
        size_bytes: u64,
        capacity_bytes: u64,
    },

    #[error("{0} is a directory, only files can be cached")]
    NotAFile(String),

    #[error("{0} does not map to a path inside the cache")]
    InvalidUrl(String),

    #[error("Failed to transfer {url}: {source}")]
    Transfer {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install {}: {source}", path.display())]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unreadable cache metadata {}: {reason}", path.display())]
    Metadata { path: PathBuf, reason: String },

    #[error(transparent)]
    Remote(#[from] WebDavError),
}

impl CacheError {
    /// Whether the failure should take the whole daemon down
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::Remote(e) if e.is_fatal())
    }
}

//! Local file cache
//!
//! Mirrors remote WebDAV files onto local disk (`file_cache`), one
//! `CachedFile` per remote file, filled by `RemoteFileLoader`. Remote
//! PROPFIND results get their own short-lived cache (`metadata`).

pub mod cached_file;
pub mod errors;
pub mod file_cache;
pub mod legacy;
pub mod loader;
pub mod metadata;

pub use cached_file::CachedFile;
pub use errors::CacheError;
pub use file_cache::{CacheStats, LocalFileCache};
pub use loader::RemoteFileLoader;
pub use metadata::MetadataCache;

//! IPC protocol definitions for client-daemon communication
//!
//! This module defines the JSON protocol used between GUI clients and the
//! cache daemon over a Unix domain socket. One JSON object per line.

use serde::{Deserialize, Serialize};

use crate::webdav::WebDavFile;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands sent from clients to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Make a remote file available locally
    Fetch {
        /// Absolute URL, or a path relative to the configured WebDAV root
        url: String,
    },
    /// Drop a file from the cache
    Evict { url: String },
    /// List the direct children of a remote collection
    List { url: String },
    /// Drop every cached file
    Clear,
    /// Get daemon status and cache counters
    GetStatus,
}

/// Responses sent from the daemon to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Success response
    #[serde(rename_all = "camelCase")]
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error response
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error message
        error: String,
    },
    /// A file is available on local disk
    #[serde(rename_all = "camelCase")]
    File {
        url: String,
        local_path: String,
        size_bytes: u64,
    },
    /// Remote collection listing
    #[serde(rename_all = "camelCase")]
    Listing { files: Vec<RemoteEntry> },
    /// Status response with daemon state
    #[serde(rename_all = "camelCase")]
    Status {
        /// Protocol version
        version: u32,
        /// Whether daemon is healthy
        healthy: bool,
        /// WebDAV connection health: healthy, degraded or unhealthy
        remote_health: String,
        entries: u64,
        used_kb: u64,
        capacity_kb: u64,
        hits: u64,
        misses: u64,
        /// Remote metadata lookups answered without a PROPFIND
        metadata_hits: u64,
        metadata_misses: u64,
    },
}

/// One remote resource in a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub url: String,
    pub name: String,
    pub is_directory: bool,
    pub etag: Option<String>,
    pub size_bytes: u64,
}

impl From<&WebDavFile> for RemoteEntry {
    fn from(file: &WebDavFile) -> Self {
        Self {
            url: file.url.to_string(),
            name: file.base_name().to_string(),
            is_directory: file.is_directory,
            etag: file.etag.clone(),
            size_bytes: file.size_bytes,
        }
    }
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}

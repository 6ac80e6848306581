//! Daemon configuration
//!
//! Settings come from environment variables, with platform defaults for
//! anything unset.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;

use crate::webdav::Credentials;

/// Default cache capacity: 1 GB
const DEFAULT_CAPACITY_KB: u64 = 1024 * 1024;

/// Default socket path for IPC communication
const DEFAULT_SOCKET_PATH: &str = "/tmp/jacs-file-cache.sock";

/// Default lifetime of cached PROPFIND results
const DEFAULT_METADATA_TTL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root holding the `active` and `temp` trees
    pub cache_dir: PathBuf,
    /// Total capacity of the active tree in kilobytes
    pub capacity_kb: u64,
    /// Base URL of the WebDAV server, if configured
    pub webdav_url: Option<Url>,
    pub credentials: Credentials,
    pub socket_path: PathBuf,
    pub metadata_ttl: Duration,
}

impl Settings {
    /// Read settings from `JACS_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_dir = match lookup("JACS_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("jacs-file-cache"),
        };

        let capacity_kb = match lookup("JACS_CACHE_CAPACITY_KB") {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("Invalid JACS_CACHE_CAPACITY_KB: {}", value))?,
            None => DEFAULT_CAPACITY_KB,
        };
        if capacity_kb == 0 {
            return Err(anyhow!("JACS_CACHE_CAPACITY_KB must be greater than zero"));
        }

        let webdav_url = lookup("JACS_WEBDAV_URL")
            .map(|value| {
                Url::parse(&value).with_context(|| format!("Invalid JACS_WEBDAV_URL: {}", value))
            })
            .transpose()?;

        let credentials = match (
            lookup("JACS_AUTH_TOKEN"),
            lookup("JACS_WEBDAV_USER"),
            lookup("JACS_WEBDAV_PASSWORD"),
        ) {
            (Some(token), _, _) => Credentials::Bearer(token),
            (None, Some(user), Some(password)) => Credentials::Basic { user, password },
            (None, Some(_), None) => {
                return Err(anyhow!("JACS_WEBDAV_USER is set but JACS_WEBDAV_PASSWORD is not"))
            }
            _ => Credentials::Anonymous,
        };

        let socket_path = lookup("JACS_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));

        let metadata_ttl = match lookup("JACS_METADATA_TTL_SECS") {
            Some(value) => Duration::from_secs(
                value
                    .parse()
                    .with_context(|| format!("Invalid JACS_METADATA_TTL_SECS: {}", value))?,
            ),
            None => Duration::from_secs(DEFAULT_METADATA_TTL_SECS),
        };

        Ok(Self {
            cache_dir,
            capacity_kb,
            webdav_url,
            credentials,
            socket_path,
            metadata_ttl,
        })
    }

    /// Resolve a CLI/IPC argument to a URL, relative to the WebDAV base if configured
    ///
    /// With a base configured, absolute URLs must share its origin so
    /// credentials are never sent to another host. Queries and fragments
    /// are refused.
    pub fn resolve_url(&self, target: &str) -> Result<Url> {
        let url = match (Url::parse(target), &self.webdav_url) {
            (Ok(url), Some(base)) if url.origin() != base.origin() => {
                return Err(anyhow!("{} is not on the WebDAV server {}", url, base));
            }
            (Ok(url), _) => url,
            (Err(_), Some(base)) => base
                .join(target.trim_start_matches('/'))
                .with_context(|| format!("Cannot resolve {} against {}", target, base))?,
            (Err(_), None) => {
                return Err(anyhow!("{} is not a URL and JACS_WEBDAV_URL is not set", target));
            }
        };

        if url.query().is_some() || url.fragment().is_some() {
            return Err(anyhow!("{} must not carry a query or fragment", url));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.capacity_kb, DEFAULT_CAPACITY_KB);
        assert!(settings.cache_dir.ends_with("jacs-file-cache"));
        assert!(settings.webdav_url.is_none());
        assert!(matches!(settings.credentials, Credentials::Anonymous));
        assert_eq!(settings.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(settings.metadata_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let settings = settings(&[
            ("JACS_CACHE_DIR", "/var/cache/jacs"),
            ("JACS_CACHE_CAPACITY_KB", "10"),
            ("JACS_WEBDAV_URL", "https://dav.example.org/files/"),
            ("JACS_WEBDAV_USER", "alice"),
            ("JACS_WEBDAV_PASSWORD", "secret"),
            ("JACS_METADATA_TTL_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(settings.cache_dir, PathBuf::from("/var/cache/jacs"));
        assert_eq!(settings.capacity_kb, 10);
        assert!(matches!(settings.credentials, Credentials::Basic { .. }));
        assert_eq!(settings.metadata_ttl, Duration::from_secs(5));
        assert_eq!(
            settings.resolve_url("/data/x.txt").unwrap().as_str(),
            "https://dav.example.org/files/data/x.txt"
        );
        assert_eq!(
            settings.resolve_url("https://dav.example.org/files/y").unwrap().as_str(),
            "https://dav.example.org/files/y"
        );
    }

    #[test]
    fn test_resolve_url_stays_on_server() {
        let s = settings(&[("JACS_WEBDAV_URL", "https://dav.example.org/files/")]).unwrap();
        assert!(s.resolve_url("http://other/y").is_err());
        assert!(s.resolve_url("http://dav.example.org/files/y").is_err());
        assert!(s.resolve_url("https://dav.example.org:8443/files/y").is_err());
        assert!(s.resolve_url("data/x.txt?v=2").is_err());
        assert!(s.resolve_url("https://dav.example.org/files/x#top").is_err());

        // Without a base any absolute URL is accepted
        let open = settings(&[]).unwrap();
        assert_eq!(open.resolve_url("http://other/y").unwrap().as_str(), "http://other/y");
    }

    #[test]
    fn test_token_wins_over_basic() {
        let settings = settings(&[
            ("JACS_AUTH_TOKEN", "jwt"),
            ("JACS_WEBDAV_USER", "alice"),
            ("JACS_WEBDAV_PASSWORD", "secret"),
        ])
        .unwrap();
        assert!(matches!(settings.credentials, Credentials::Bearer(t) if t == "jwt"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(settings(&[("JACS_CACHE_CAPACITY_KB", "lots")]).is_err());
        assert!(settings(&[("JACS_CACHE_CAPACITY_KB", "0")]).is_err());
        assert!(settings(&[("JACS_WEBDAV_URL", "not a url")]).is_err());
        assert!(settings(&[("JACS_WEBDAV_USER", "alice")]).is_err());
        assert!(settings(&[]).unwrap().resolve_url("data/x.txt").is_err());
    }
}

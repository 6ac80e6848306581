//! WebDAV Client
//!
//! Provides authenticated access to a WebDAV server for resource lookups,
//! collection listings, downloads and uploads.

use std::future::Future;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use reqwest::{Client, Method, Url};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::errors::WebDavError;
use super::store::{BlockingBody, RemoteStore};
use super::types::{parse_multistatus, WebDavFile, PROPFIND_BODY};
use crate::cache::MetadataCache;

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// Base delay before the first retry; doubles on each attempt
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Health status values
pub const HEALTH_HEALTHY: u8 = 0;
pub const HEALTH_DEGRADED: u8 = 1;
pub const HEALTH_UNHEALTHY: u8 = 2;

/// How requests authenticate against the server
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    #[default]
    Anonymous,
    /// Token issued by the auth service, sent as `Authorization: Bearer`
    Bearer(String),
    Basic { user: String, password: String },
}

impl Credentials {
    fn header_value(&self) -> Option<String> {
        match self {
            Credentials::Anonymous => None,
            Credentials::Bearer(token) => Some(format!("Bearer {}", token)),
            Credentials::Basic { user, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, password));
                Some(format!("Basic {}", encoded))
            }
        }
    }
}

/// PROPFIND depth
#[derive(Debug, Clone, Copy)]
enum Depth {
    Zero,
    One,
}

impl Depth {
    fn as_header(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
        }
    }
}

/// WebDAV client for making authenticated requests
#[derive(Clone)]
pub struct WebDavClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Precomputed Authorization header, if any
    auth_header: Option<String>,
    /// Runtime used to drive requests from blocking callers
    runtime: Handle,
    /// Short-lived PROPFIND result cache
    metadata: Arc<MetadataCache>,
    /// Connection health (0=healthy, 1=degraded, 2=unhealthy)
    health: Arc<AtomicU8>,
    backoff: Duration,
}

fn dav_method(name: &'static str) -> Result<Method, WebDavError> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| WebDavError::Request(format!("invalid method {}: {}", name, e)))
}

/// Listing cache key: collection URLs always carry a trailing slash
fn collection_key(url: &Url) -> String {
    let key = url.as_str();
    if key.ends_with('/') {
        key.to_string()
    } else {
        format!("{}/", key)
    }
}

/// URL of the collection containing `url`
fn parent_url(url: &Url) -> Option<Url> {
    let mut parent = url.clone();
    {
        let mut segments = parent.path_segments_mut().ok()?;
        segments.pop_if_empty().pop().push("");
    }
    Some(parent)
}

impl WebDavClient {
    /// Create a client bound to the current tokio runtime
    ///
    /// # Arguments
    /// * `credentials` - How to authenticate against the server
    /// * `metadata` - Cache for PROPFIND results
    pub fn new(credentials: Credentials, metadata: Arc<MetadataCache>) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let runtime = Handle::try_current().context("WebDAV client requires a tokio runtime")?;

        Ok(Self {
            http_client,
            auth_header: credentials.header_value(),
            runtime,
            metadata,
            health: Arc::new(AtomicU8::new(HEALTH_HEALTHY)),
            backoff: DEFAULT_BACKOFF,
        })
    }

    /// Override the base retry delay
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Get connection health status string
    pub fn health_status(&self) -> &'static str {
        match self.health.load(Ordering::Relaxed) {
            HEALTH_HEALTHY => "healthy",
            HEALTH_DEGRADED => "degraded",
            _ => "unhealthy",
        }
    }

    fn request(&self, method: Method, url: &Url) -> reqwest::RequestBuilder {
        let request = self.http_client.request(method, url.clone());
        match &self.auth_header {
            Some(header) => request.header("Authorization", header),
            None => request,
        }
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, url: &Url, f: F) -> Result<T, WebDavError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, WebDavError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(result) => {
                    self.health.store(HEALTH_HEALTHY, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt == MAX_RETRIES {
                        match &e {
                            WebDavError::Network(_)
                            | WebDavError::Timeout
                            | WebDavError::AuthFailed => {
                                self.health.store(HEALTH_UNHEALTHY, Ordering::Relaxed)
                            }
                            WebDavError::RateLimited | WebDavError::Server(_, _) => {
                                self.health.store(HEALTH_DEGRADED, Ordering::Relaxed)
                            }
                            _ => {}
                        }
                        debug!(operation = operation, url = %url, error = %e, "WebDAV operation failed");
                        return Err(e);
                    }

                    let delay = self.backoff * 2u32.pow(attempt);
                    warn!(
                        operation = operation,
                        url = %url,
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying WebDAV operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Send a request and turn non-success statuses into errors
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, WebDavError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(WebDavError::from_status(status, &body));
        }
        Ok(response)
    }

    async fn propfind(&self, url: &Url, depth: Depth) -> Result<Vec<WebDavFile>, WebDavError> {
        let method = dav_method("PROPFIND")?;
        self.with_retry("propfind", url, || async {
            let request = self
                .request(method.clone(), url)
                .header("Depth", depth.as_header())
                .header("Content-Type", "application/xml; charset=utf-8")
                .body(PROPFIND_BODY);
            let response = self.send(request).await?;
            let body = response.text().await?;
            parse_multistatus(url, &body)
        })
        .await
    }

    /// Fetch metadata for a single resource (PROPFIND, Depth 0)
    pub async fn fetch_file(&self, url: &Url) -> Result<WebDavFile, WebDavError> {
        if let Some(file) = self.metadata.get_file(url.as_str()) {
            return Ok(file);
        }

        debug!(url = %url, "Looking up remote file");
        let file = self
            .propfind(url, Depth::Zero)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| WebDavError::NotFound(url.to_string()))?;

        self.metadata.insert_file(url.as_str(), file.clone());
        Ok(file)
    }

    /// List the direct children of a collection (PROPFIND, Depth 1)
    pub async fn list_collection(&self, url: &Url) -> Result<Vec<WebDavFile>, WebDavError> {
        let key = collection_key(url);
        if let Some(files) = self.metadata.get_dir(&key) {
            return Ok(files);
        }

        let files: Vec<WebDavFile> = self
            .propfind(url, Depth::One)
            .await?
            .into_iter()
            .filter(|f| !f.is_same_resource(url))
            .collect();

        debug!(url = %url, count = files.len(), "Listed remote collection");
        self.metadata.insert_dir(&key, files.clone());
        Ok(files)
    }

    /// Start downloading a file; the body is streamed by the caller
    pub async fn download(&self, file: &WebDavFile) -> Result<reqwest::Response, WebDavError> {
        debug!(url = %file.url, size = file.size_bytes, "Downloading remote file");
        self.with_retry("get", &file.url, || async {
            self.send(self.request(Method::GET, &file.url)).await
        })
        .await
    }

    /// Create a collection (MKCOL)
    pub async fn make_collection(&self, url: &Url) -> Result<(), WebDavError> {
        let method = dav_method("MKCOL")?;
        self.with_retry("mkcol", url, || async {
            self.send(self.request(method.clone(), url)).await.map(|_| ())
        })
        .await?;

        self.invalidate_with_parent(url);
        info!(url = %url, "Created remote collection");
        Ok(())
    }

    /// Upload file content (PUT)
    pub async fn upload(&self, url: &Url, data: Vec<u8>) -> Result<(), WebDavError> {
        let size = data.len();
        self.with_retry("put", url, || async {
            let request = self
                .request(Method::PUT, url)
                .header("Content-Type", "application/octet-stream")
                .body(data.clone());
            self.send(request).await.map(|_| ())
        })
        .await?;

        self.invalidate_with_parent(url);
        info!(url = %url, size = size, "Uploaded file");
        Ok(())
    }

    fn invalidate_with_parent(&self, url: &Url) {
        self.metadata.invalidate(url.as_str());
        self.metadata.invalidate(&collection_key(url));
        if let Some(parent) = parent_url(url) {
            self.metadata.invalidate(parent.as_str());
        }
    }
}

impl RemoteStore for WebDavClient {
    fn find_file(&self, url: &Url) -> Result<WebDavFile, WebDavError> {
        self.runtime.block_on(self.fetch_file(url))
    }

    fn find_immediate_internal_files(&self, url: &Url) -> Result<Vec<WebDavFile>, WebDavError> {
        self.runtime.block_on(self.list_collection(url))
    }

    fn create_directory(&self, url: &Url) -> Result<(), WebDavError> {
        self.runtime.block_on(self.make_collection(url))
    }

    fn save_file(&self, url: &Url, file: &Path) -> Result<(), WebDavError> {
        let data = std::fs::read(file)?;
        self.runtime.block_on(self.upload(url, data))
    }

    fn open_stream(&self, file: &WebDavFile) -> Result<Box<dyn Read + Send>, WebDavError> {
        let response = self.runtime.block_on(self.download(file))?;
        Ok(Box::new(BlockingBody::new(response, self.runtime.clone())))
    }

    fn health(&self) -> &'static str {
        self.health_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn multistatus(entries: &[(&str, Option<u64>, bool)]) -> String {
        let mut body = String::from(r#"<?xml version="1.0"?><D:multistatus xmlns:D="DAV:">"#);
        for (href, len, is_dir) in entries {
            body.push_str("<D:response><D:href>");
            body.push_str(href);
            body.push_str("</D:href><D:propstat><D:prop>");
            if *is_dir {
                body.push_str("<D:resourcetype><D:collection/></D:resourcetype>");
            } else {
                body.push_str("<D:resourcetype/><D:getetag>\"v1\"</D:getetag>");
            }
            if let Some(len) = len {
                body.push_str(&format!("<D:getcontentlength>{}</D:getcontentlength>", len));
            }
            body.push_str("</D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>");
        }
        body.push_str("</D:multistatus>");
        body
    }

    fn client() -> WebDavClient {
        WebDavClient::new(
            Credentials::Bearer("tok".to_string()),
            Arc::new(MetadataCache::new()),
        )
        .unwrap()
        .with_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_credentials_header() {
        assert_eq!(Credentials::Anonymous.header_value(), None);
        assert_eq!(
            Credentials::Bearer("abc".to_string()).header_value(),
            Some("Bearer abc".to_string())
        );
        assert_eq!(
            Credentials::Basic {
                user: "user".to_string(),
                password: "pass".to_string()
            }
            .header_value(),
            Some("Basic dXNlcjpwYXNz".to_string())
        );
    }

    #[test]
    fn test_parent_url() {
        let file = Url::parse("http://h/a/b/c.txt").unwrap();
        assert_eq!(parent_url(&file).unwrap().as_str(), "http://h/a/b/");
        let dir = Url::parse("http://h/a/b/").unwrap();
        assert_eq!(parent_url(&dir).unwrap().as_str(), "http://h/a/");
        assert_eq!(collection_key(&Url::parse("http://h/a").unwrap()), "http://h/a/");
    }

    #[tokio::test]
    async fn test_fetch_file_uses_propfind_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .and(path("/data/x.txt"))
            .and(header("Depth", "0"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(207).set_body_string(multistatus(&[("/data/x.txt", Some(1200), false)])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client();
        let url = Url::parse(&format!("{}/data/x.txt", server.uri())).unwrap();

        let file = client.fetch_file(&url).await.unwrap();
        assert_eq!(file.size_bytes, 1200);
        assert_eq!(file.etag.as_deref(), Some("\"v1\""));

        // Second lookup is served from the metadata cache
        let again = client.fetch_file(&url).await.unwrap();
        assert_eq!(again, file);
    }

    #[tokio::test]
    async fn test_list_collection_excludes_self() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .and(path("/data/"))
            .and(header("Depth", "1"))
            .respond_with(ResponseTemplate::new(207).set_body_string(multistatus(&[
                ("/data/", None, true),
                ("/data/x.txt", Some(10), false),
                ("/data/sub/", None, true),
            ])))
            .mount(&server)
            .await;

        let client = client();
        let url = Url::parse(&format!("{}/data/", server.uri())).unwrap();
        let files = client.list_collection(&url).await.unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].base_name(), "x.txt");
        assert!(files[1].is_directory);
    }

    #[tokio::test]
    async fn test_not_found_and_auth_failures() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PROPFIND"))
            .and(path("/secret"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client();
        let missing = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let secret = Url::parse(&format!("{}/secret", server.uri())).unwrap();

        assert!(matches!(client.fetch_file(&missing).await, Err(WebDavError::NotFound(_))));
        assert_eq!(client.health_status(), "healthy");

        let err = client.fetch_file(&secret).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(client.health_status(), "unhealthy");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.bin"))
            .respond_with(ResponseTemplate::new(500))
            .expect(u64::from(MAX_RETRIES) + 1)
            .mount(&server)
            .await;

        let client = client();
        let file = WebDavFile {
            url: Url::parse(&format!("{}/flaky.bin", server.uri())).unwrap(),
            is_directory: false,
            etag: None,
            size_bytes: 3,
        };

        assert!(matches!(client.download(&file).await, Err(WebDavError::Server(500, _))));
        assert_eq!(client.health_status(), "degraded");
    }

    #[tokio::test]
    async fn test_upload_invalidates_parent_listing() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/data/new.txt"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = client();
        let dir = Url::parse(&format!("{}/data/", server.uri())).unwrap();
        client.metadata().insert_dir(dir.as_str(), vec![]);

        let url = Url::parse(&format!("{}/data/new.txt", server.uri())).unwrap();
        client.upload(&url, b"hello".to_vec()).await.unwrap();

        assert!(client.metadata().get_dir(dir.as_str()).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_store_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/x.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 5000]))
            .mount(&server)
            .await;

        let client = client();
        let file = WebDavFile {
            url: Url::parse(&format!("{}/data/x.txt", server.uri())).unwrap(),
            is_directory: false,
            etag: None,
            size_bytes: 5000,
        };

        let bytes = tokio::task::spawn_blocking(move || {
            let mut stream = client.open_stream(&file).unwrap();
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes).unwrap();
            bytes
        })
        .await
        .unwrap();

        assert_eq!(bytes.len(), 5000);
        assert!(bytes.iter().all(|b| *b == 7));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_store_writes() {
        let server = MockServer::start().await;
        Mock::given(method("MKCOL"))
            .and(path("/data/new/"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/data/new/x.txt"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PROPFIND"))
            .and(path("/data/gone.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client();
        let base = server.uri();
        let local = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(local.path(), b"payload").unwrap();
        let local_path = local.path().to_path_buf();

        let available = tokio::task::spawn_blocking(move || {
            let dir = Url::parse(&format!("{}/data/new/", base)).unwrap();
            client.create_directory(&dir).unwrap();
            let file = dir.join("x.txt").unwrap();
            client.save_file(&file, &local_path).unwrap();
            let gone = Url::parse(&format!("{}/data/gone.txt", base)).unwrap();
            client.is_available(&gone).unwrap()
        })
        .await
        .unwrap();

        assert!(!available);
    }
}

//! WebDAV resource types and multistatus parsing
//!
//! Defines the remote file descriptor and the PROPFIND response parser.

use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Url;

use super::errors::WebDavError;

/// Request body for PROPFIND: only the properties the cache needs
pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:resourcetype/>
    <D:getetag/>
    <D:getcontentlength/>
  </D:prop>
</D:propfind>"#;

/// Metadata for a remote file or collection, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebDavFile {
    /// Absolute URL of the resource
    pub url: Url,
    /// Whether the resource is a collection
    pub is_directory: bool,
    /// Entity tag, when the server supplies one
    pub etag: Option<String>,
    /// Content length in bytes (0 for collections)
    pub size_bytes: u64,
}

impl WebDavFile {
    /// Size rounded up to whole kilobytes, the unit the cache weighs entries in
    pub fn kilobytes(&self) -> u64 {
        self.size_bytes.div_ceil(1024)
    }

    /// Last path component (without trailing slash)
    pub fn base_name(&self) -> &str {
        let path = self.url.path().trim_end_matches('/');
        path.rsplit('/').next().unwrap_or(path)
    }

    /// Whether this descriptor names the same resource as `url`,
    /// ignoring a trailing slash on collections.
    pub fn is_same_resource(&self, url: &Url) -> bool {
        self.url.host_str() == url.host_str()
            && self.url.port_or_known_default() == url.port_or_known_default()
            && self.url.path().trim_end_matches('/') == url.path().trim_end_matches('/')
    }
}

/// The property currently being read inside a `<response>` element
#[derive(Debug, Clone, Copy)]
enum Field {
    Href,
    Etag,
    ContentLength,
}

#[derive(Debug, Default)]
struct ResponseEntry {
    href: Option<String>,
    etag: Option<String>,
    content_length: Option<u64>,
    is_collection: bool,
}

impl ResponseEntry {
    fn into_file(self, base: &Url) -> Result<WebDavFile, WebDavError> {
        let href = self
            .href
            .ok_or_else(|| WebDavError::InvalidResponse("response without href".to_string()))?;
        let url = base
            .join(&href)
            .map_err(|e| WebDavError::InvalidResponse(format!("bad href {}: {}", href, e)))?;

        Ok(WebDavFile {
            url,
            is_directory: self.is_collection,
            etag: self.etag,
            size_bytes: if self.is_collection {
                0
            } else {
                self.content_length.unwrap_or(0)
            },
        })
    }
}

/// Parse a `207 Multi-Status` body into file descriptors.
///
/// Element prefixes vary between servers (`D:`, `d:`, `lp1:`), so matching
/// is done on local names only. Hrefs are resolved against `base`.
pub fn parse_multistatus(base: &Url, xml: &str) -> Result<Vec<WebDavFile>, WebDavError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut files = Vec::new();
    let mut current: Option<ResponseEntry> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => current = Some(ResponseEntry::default()),
                b"href" => field = Some(Field::Href),
                b"getetag" => field = Some(Field::Etag),
                b"getcontentlength" => field = Some(Field::ContentLength),
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field) {
                    let text = t
                        .unescape()
                        .map_err(|e| WebDavError::InvalidResponse(e.to_string()))?
                        .into_owned();
                    match f {
                        Field::Href => entry.href = Some(text),
                        Field::Etag => entry.etag = Some(text),
                        Field::ContentLength => {
                            entry.content_length = Some(text.parse().map_err(|_| {
                                WebDavError::InvalidResponse(format!(
                                    "bad getcontentlength: {}",
                                    text
                                ))
                            })?);
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(entry) = current.take() {
                        files.push(entry.into_file(base)?);
                    }
                }
                b"href" | b"getetag" | b"getcontentlength" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(WebDavError::InvalidResponse(e.to_string())),
            _ => {}
        }
    }

    Ok(files)
}

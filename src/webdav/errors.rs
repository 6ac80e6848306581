//! WebDAV Error Types
//!
//! Structured error handling for WebDAV operations.
//! Maps HTTP status codes to specific error variants for retry and fatality decisions.

/// WebDAV error types
#[derive(Debug, thiserror::Error)]
pub enum WebDavError {
    #[error("Authentication rejected by WebDAV server")]
    AuthFailed,

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),

    #[error("Malformed multistatus response: {0}")]
    InvalidResponse(String),

    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebDavError {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WebDavError::RateLimited
                | WebDavError::Timeout
                | WebDavError::Network(_)
                | WebDavError::Server(_, _)
        )
    }

    /// Whether this error means the remote tier cannot be used at all.
    ///
    /// Authentication failures and gateway-level server failures fall in this
    /// bucket; the daemon shuts down when one of these escapes a request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WebDavError::AuthFailed | WebDavError::Server(502..=504, _)
        )
    }

    /// Create a WebDavError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => WebDavError::AuthFailed,
            403 => WebDavError::Forbidden(body.to_string()),
            404 => WebDavError::NotFound(body.to_string()),
            408 => WebDavError::Timeout,
            429 => WebDavError::RateLimited,
            500..=599 => WebDavError::Server(status, body.to_string()),
            _ => WebDavError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for WebDavError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WebDavError::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            WebDavError::Network(err.to_string())
        } else {
            WebDavError::Request(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(matches!(WebDavError::from_status(401, ""), WebDavError::AuthFailed));
        assert!(matches!(WebDavError::from_status(404, "gone"), WebDavError::NotFound(b) if b == "gone"));
        assert!(matches!(WebDavError::from_status(429, ""), WebDavError::RateLimited));
        assert!(matches!(WebDavError::from_status(503, ""), WebDavError::Server(503, _)));
        assert!(matches!(WebDavError::from_status(418, ""), WebDavError::Request(_)));
    }

    #[test]
    fn test_retry_and_fatal_classification() {
        assert!(WebDavError::RateLimited.is_retryable());
        assert!(WebDavError::Server(500, String::new()).is_retryable());
        assert!(!WebDavError::NotFound(String::new()).is_retryable());
        assert!(!WebDavError::AuthFailed.is_retryable());

        assert!(WebDavError::AuthFailed.is_fatal());
        assert!(WebDavError::Server(503, String::new()).is_fatal());
        assert!(!WebDavError::Server(500, String::new()).is_fatal());
        assert!(!WebDavError::NotFound(String::new()).is_fatal());
    }
}

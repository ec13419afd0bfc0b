//! Provider error classification.
//!
//! Distinguishes failures the executor retries (rate limits, transient
//! upstream/network errors) from failures that skip straight to the next
//! provider in the chain (auth, malformed request).

use std::time::Duration;

/// Error from a provider adapter call.
#[derive(Debug)]
pub struct ProviderError {
    /// The failure class; drives retry/fallback behaviour.
    pub class: ProviderErrorClass,
    /// HTTP status code, if the upstream answered at all.
    pub status: Option<u16>,
    /// Error message (upstream body or transport error).
    pub message: String,
    /// Parsed `Retry-After`, when the upstream supplied one.
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn auth(status: u16, message: String) -> Self {
        Self {
            class: ProviderErrorClass::Auth,
            status: Some(status),
            message,
            retry_after: None,
        }
    }

    pub fn bad_request(status: u16, message: String) -> Self {
        Self {
            class: ProviderErrorClass::BadRequest,
            status: Some(status),
            message,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            class: ProviderErrorClass::RateLimited,
            status: Some(429),
            message,
            retry_after,
        }
    }

    pub fn transient(status: Option<u16>, message: String) -> Self {
        Self {
            class: ProviderErrorClass::Transient,
            status,
            message,
            retry_after: None,
        }
    }

    /// Build from an HTTP response status + body, using the standard
    /// classification rules.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status) {
            ProviderErrorClass::Auth => Self::auth(status, body),
            ProviderErrorClass::BadRequest => Self::bad_request(status, body),
            ProviderErrorClass::RateLimited => Self::rate_limited(body, retry_after),
            ProviderErrorClass::Transient => Self::transient(Some(status), body),
        }
    }

    /// Build from a transport-level reqwest error (no HTTP response).
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("Request timeout: {}", err)
        } else if err.is_connect() {
            format!("Connection failed: {}", err)
        } else {
            format!("Request failed: {}", err)
        };
        Self::transient(None, message)
    }

    /// Whether the executor may retry this error against the same provider.
    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.class, code, self.message),
            None => write!(f, "{}: {}", self.class, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Classification of provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorClass {
    /// 401/403 - permanently broken credentials; skip to next provider
    Auth,
    /// 400/404/422 - request the upstream will never accept; skip to next provider
    BadRequest,
    /// 429 - retryable with backoff, honouring Retry-After
    RateLimited,
    /// 5xx or network failure - retryable with backoff
    Transient,
}

impl ProviderErrorClass {
    /// Whether this class is worth retrying against the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient)
    }
}

impl std::fmt::Display for ProviderErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth => write!(f, "auth error"),
            Self::BadRequest => write!(f, "bad request"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::Transient => write!(f, "transient error"),
        }
    }
}

/// Map an HTTP status code onto a failure class.
pub fn classify_http_status(status: u16) -> ProviderErrorClass {
    match status {
        401 | 403 => ProviderErrorClass::Auth,
        429 => ProviderErrorClass::RateLimited,
        400..=499 => ProviderErrorClass::BadRequest,
        _ => ProviderErrorClass::Transient,
    }
}

/// Parse a `Retry-After` header (seconds form) if present.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok().map(Duration::from_secs))
}

//! Error types for the network resilience layer.
//!
//! [`NetworkError`] describes one failed attempt; [`NetworkError::kind`] maps it
//! onto a [`NetworkErrorKind`] that drives retry and circuit decisions.
//! [`ResilienceError`] is what callers of
//! [`NetworkResilience::execute`](super::NetworkResilience::execute) see.

use std::error::Error as _;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::rate_limiter::parse_retry_after;

/// Failure classes used for retry and circuit breaker decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    /// Connection refused, reset, or otherwise broken below HTTP.
    Network,
    /// No response within the per-request timeout.
    Timeout,
    /// Client error response other than 429.
    Http4xx,
    /// Server error response.
    Http5xx,
    /// Host name could not be resolved.
    Dns,
    /// HTTP 429 Too Many Requests.
    RateLimited,
}

impl NetworkErrorKind {
    /// Whether a request failing this way may succeed if repeated.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Http4xx)
    }

    /// Whether the failure happened below HTTP (the host may be unreachable).
    #[must_use]
    pub fn is_connection_level(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Dns)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Http4xx => "http4xx",
            Self::Http5xx => "http5xx",
            Self::Dns => "dns",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed request attempt.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Transport error reported by the HTTP client.
    #[error("network error requesting {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Connection-level failure without an underlying client error.
    #[error("connection failed for {url}: {message}")]
    Connection { url: String, message: String },

    /// The attempt exceeded its computed timeout.
    #[error("timeout requesting {url} after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    /// Non-success HTTP status.
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Raw Retry-After header, if the server sent one.
        retry_after: Option<String>,
    },

    /// Host name resolution failed.
    #[error("DNS resolution failed for {host}: {message}")]
    Dns { host: String, message: String },
}

impl NetworkError {
    pub fn request(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Request {
            url: url.into(),
            source,
        }
    }

    pub fn connection(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            url: url.into(),
            timeout,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn dns(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dns {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Classifies this failure.
    #[must_use]
    pub fn kind(&self) -> NetworkErrorKind {
        match self {
            Self::Request { source, .. } => classify_reqwest(source),
            Self::Connection { .. } => NetworkErrorKind::Network,
            Self::Timeout { .. } => NetworkErrorKind::Timeout,
            Self::HttpStatus { status, .. } => classify_status(*status),
            Self::Dns { .. } => NetworkErrorKind::Dns,
        }
    }

    /// HTTP status, if the server answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Server-mandated wait parsed from Retry-After.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus {
                retry_after: Some(value),
                ..
            } => parse_retry_after(value),
            _ => None,
        }
    }

    /// Short explanation suitable for end users.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match (self.kind(), self.status()) {
            (NetworkErrorKind::Dns, _) => "DNS resolution failed. This is usually temporary.",
            (NetworkErrorKind::Timeout, _) => {
                "Connection timeout. The server may be overloaded or unreachable."
            }
            (NetworkErrorKind::Network, _) => {
                "Connection refused or reset. The server may be temporarily unavailable."
            }
            (NetworkErrorKind::RateLimited, _) => {
                "Rate limited. Too many requests sent too quickly."
            }
            (NetworkErrorKind::Http4xx, Some(401 | 403)) => {
                "Access forbidden. You may not have permission to access this manuscript."
            }
            (NetworkErrorKind::Http4xx, Some(404 | 410)) => {
                "Manuscript not found. The URL may be incorrect or the manuscript was moved."
            }
            (NetworkErrorKind::Http4xx, _) => "The library server rejected the request.",
            (NetworkErrorKind::Http5xx, _) => {
                "The library server reported an internal error."
            }
        }
    }

    /// What the user (or the system) should do next.
    #[must_use]
    pub fn suggested_action(&self) -> &'static str {
        match (self.kind(), self.status()) {
            (NetworkErrorKind::Dns, _) => {
                "The system will automatically retry. Check your internet connection if the problem persists."
            }
            (NetworkErrorKind::Timeout | NetworkErrorKind::Network, _) => {
                "The system will retry with longer delays. This usually resolves itself."
            }
            (NetworkErrorKind::RateLimited, _) => {
                "The system will automatically wait longer between requests and retry."
            }
            (NetworkErrorKind::Http4xx, Some(401 | 403)) => {
                "Check if you need institutional access or if the manuscript is geo-restricted."
            }
            (NetworkErrorKind::Http4xx, _) => {
                "Please verify the URL is correct and try a different manuscript."
            }
            (NetworkErrorKind::Http5xx, _) => {
                "The system will retry. If the problem persists, the library may be down."
            }
        }
    }
}

/// Maps an HTTP status onto a failure class.
#[must_use]
pub fn classify_status(status: u16) -> NetworkErrorKind {
    match status {
        408 => NetworkErrorKind::Timeout,
        429 => NetworkErrorKind::RateLimited,
        500..=599 => NetworkErrorKind::Http5xx,
        _ => NetworkErrorKind::Http4xx,
    }
}

fn classify_reqwest(error: &reqwest::Error) -> NetworkErrorKind {
    if error.is_timeout() {
        return NetworkErrorKind::Timeout;
    }
    if let Some(status) = error.status() {
        return classify_status(status.as_u16());
    }
    if is_dns_error(error) {
        return NetworkErrorKind::Dns;
    }
    NetworkErrorKind::Network
}

/// reqwest does not expose resolver failures directly; they show up in the source chain.
fn is_dns_error(error: &reqwest::Error) -> bool {
    let mut current: Option<&dyn std::error::Error> = error.source();
    while let Some(cause) = current {
        let message = cause.to_string().to_lowercase();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return true;
        }
        current = cause.source();
    }
    false
}

/// Error returned by [`NetworkResilience`](super::NetworkResilience).
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The last attempt failed and no further retry was allowed.
    #[error("{source} (after {attempts} attempt(s))")]
    Network {
        attempts: u32,
        #[source]
        source: NetworkError,
    },

    /// The host's circuit is open; no request was sent.
    #[error("service currently unavailable: circuit open for {host}, next attempt in {}s", .retry_in.as_secs())]
    CircuitOpen { host: String, retry_in: Duration },

    /// The URL could not be parsed or has no host.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },
}

impl ResilienceError {
    /// Failure class of the underlying network error, if any.
    #[must_use]
    pub fn kind(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::Network { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Network { source, .. } => source.user_message(),
            Self::CircuitOpen { .. } => {
                "This library is currently unavailable after repeated failures."
            }
            Self::InvalidUrl { .. } => "The manuscript URL is not valid.",
        }
    }

    #[must_use]
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Network { source, .. } => source.suggested_action(),
            Self::CircuitOpen { .. } => {
                "Downloads from this library will resume automatically once it recovers."
            }
            Self::InvalidUrl { .. } => "Please verify the URL is correct.",
        }
    }
}

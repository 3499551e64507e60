//! Per-host request pacing and server-mandated backoff.
//!
//! [`RateLimiter`] enforces an optional minimum spacing between requests to
//! the same host and holds a host back after it answered 429 with a
//! `Retry-After`. Requests to different hosts never wait on each other.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use manuscript_monitor::network::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(250));
//! limiter.acquire("gallica.bnf.fr").await;
//! limiter.record_rate_limit("gallica.bnf.fr", Duration::from_secs(5));
//! // Waits until the 5 second server backoff has passed.
//! limiter.acquire("gallica.bnf.fr").await;
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Per-host rate limiter, shared behind `Arc`.
#[derive(Debug, Default)]
pub struct RateLimiter {
    /// Minimum time between requests to one host; zero disables pacing.
    min_interval: Duration,

    /// Arc'd so the `DashMap` shard lock is released before awaiting the inner mutex.
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug)]
struct HostState {
    timing: Mutex<HostTiming>,
    cumulative_delay_ms: AtomicU64,
}

#[derive(Debug, Default)]
struct HostTiming {
    /// `None` until the first request, which is never delayed.
    last_request: Option<Instant>,
    /// Set from Retry-After; no request starts before this.
    blocked_until: Option<Instant>,
}

impl HostState {
    fn new() -> Self {
        Self {
            timing: Mutex::new(HostTiming::default()),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            hosts: DashMap::new(),
        }
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone()
    }

    /// Waits until a request to `host` may start, then claims the slot.
    #[instrument(level = "debug", skip(self))]
    pub async fn acquire(&self, host: &str) {
        let state = self.state(host);
        let mut timing = state.timing.lock().await;
        let now = Instant::now();

        let mut ready_at = timing.blocked_until.unwrap_or(now);
        if let Some(last) = timing.last_request
            && !self.min_interval.is_zero()
        {
            ready_at = ready_at.max(last + self.min_interval);
        }

        if ready_at > now {
            let delay = ready_at - now;
            let cumulative = state.add_cumulative_delay(delay);
            debug!(
                host,
                delay_ms = delay.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "applying rate limit delay"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    host,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider reducing request volume to this host"
                );
            }
            tokio::time::sleep_until(ready_at).await;
        }

        timing.blocked_until = None;
        timing.last_request = Some(Instant::now());
    }

    /// Holds `host` back for `delay` (from a Retry-After header).
    #[instrument(level = "debug", skip(self))]
    pub async fn record_rate_limit(&self, host: &str, delay: Duration) {
        let delay = delay.min(MAX_RETRY_AFTER);
        let state = self.state(host);
        let until = Instant::now() + delay;
        {
            let mut timing = state.timing.lock().await;
            timing.blocked_until = Some(timing.blocked_until.map_or(until, |b| b.max(until)));
        }
        debug!(host, delay_ms = delay.as_millis(), "recorded server rate limit");
    }
}

/// Host part of `url`, lowercased. `None` for malformed or host-less URLs.
///
/// ```
/// use manuscript_monitor::network::extract_host;
///
/// assert_eq!(extract_host("https://Gallica.BNF.fr/ark:/12148"), Some("gallica.bnf.fr".to_string()));
/// assert_eq!(extract_host("http://127.0.0.1:8080/x"), Some("127.0.0.1".to_string()));
/// assert_eq!(extract_host("not a url"), None);
/// ```
#[must_use]
pub fn extract_host(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

/// Parses a Retry-After header value (integer seconds or HTTP-date).
///
/// Returns `None` if unparseable. Values above one hour are capped.
///
/// ```
/// use std::time::Duration;
/// use manuscript_monitor::network::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument(level = "trace")]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        // Date in the past
        Err(_) => Some(Duration::ZERO),
    }
}

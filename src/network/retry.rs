//! Retry budget and backoff for classified network failures.
//!
//! # Overview
//!
//! Every failed attempt is classified into a
//! [`NetworkErrorKind`](super::NetworkErrorKind). [`RetryPolicy::should_retry`]
//! refuses non-retryable kinds (`Http4xx`) and exhausted budgets, and otherwise
//! returns an exponential backoff with jitter:
//!
//! ```text
//! delay = min(base * multiplier^(attempt-1) + jitter, max_delay)
//! ```
//!
//! Connection-level failures wait 1.5x longer. An attempt answered with
//! Retry-After waits at least that long, unless the server asks for more than
//! `max_delay`: then retrying stops and the per-host wait is left to the
//! [`RateLimiter`](super::RateLimiter).
//!
//! # Example
//!
//! ```
//! use manuscript_monitor::network::{NetworkError, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let error = NetworkError::http_status("https://example.org/iiif/manifest.json", 503);
//!
//! match policy.should_retry(&error, 1) {
//!     RetryDecision::Retry { delay, attempt } => println!("retry #{attempt} in {delay:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    JITTER_FRACTION, NETWORK_ERROR_BACKOFF_FACTOR,
};
use super::error::{NetworkError, NetworkErrorKind};

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`.
    Retry {
        delay: Duration,
        /// The upcoming attempt number (1-indexed, so the first retry is 2).
        attempt: u32,
    },
    /// Give up.
    DoNotRetry { reason: String },
}

/// Retry budget and backoff shape.
///
/// Defaults: 3 attempts, 1s base, 30s cap, doubling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to retry after attempt number `attempt` failed with `error`.
    #[instrument(level = "debug", skip(self, error), fields(kind = %error.kind(), max_attempts = self.max_attempts))]
    pub fn should_retry(&self, error: &NetworkError, attempt: u32) -> RetryDecision {
        let kind = error.kind();
        if !kind.is_retryable() {
            return RetryDecision::DoNotRetry {
                reason: format!("{kind} failure - retry would not help"),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let mut delay = self.backoff(attempt, kind);
        if let Some(server_delay) = error.retry_after() {
            if server_delay > self.max_delay {
                debug!(
                    attempt,
                    retry_after_secs = server_delay.as_secs(),
                    "server delay exceeds max delay"
                );
                return RetryDecision::DoNotRetry {
                    reason: format!(
                        "server asked to wait {}s, more than the {}s retry cap",
                        server_delay.as_secs(),
                        self.max_delay.as_secs()
                    ),
                };
            }
            delay = delay.max(server_delay);
        }

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff after `attempt` failed with `kind`, jitter included, capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32, kind: NetworkErrorKind) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let exponent = f64::from(attempt.saturating_sub(1));
        let mut delay = base * self.backoff_multiplier.powf(exponent) + self.jitter(base);
        if kind.is_connection_level() {
            delay *= NETWORK_ERROR_BACKOFF_FACTOR;
        }
        Duration::try_from_secs_f64(delay)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Random jitter in `[0, base * JITTER_FRACTION]` seconds.
    fn jitter(&self, base: f64) -> f64 {
        let bound = base * JITTER_FRACTION;
        if bound <= 0.0 {
            return 0.0;
        }
        rand::thread_rng().gen_range(0.0..=bound)
    }
}

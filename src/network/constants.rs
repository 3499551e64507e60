//! Defaults for the network resilience layer (breaker, retry, timeouts, DNS, pooling).

use std::time::Duration;

/// Consecutive retryable failures that open a host's circuit.
pub const FAILURE_THRESHOLD: u32 = 5;

/// Time an open circuit waits before allowing half-open probes (60 seconds).
pub const RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Probe calls admitted while a circuit is half-open.
pub const HALF_OPEN_MAX_CALLS: u32 = 3;

/// Retry hint returned while half-open probes are still in flight.
pub const HALF_OPEN_RETRY_HINT: Duration = Duration::from_secs(1);

/// Maximum attempts per request, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff before the first retry (1 second).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Backoff cap (30 seconds).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Backoff growth per attempt.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Jitter upper bound as a fraction of the base delay.
pub const JITTER_FRACTION: f64 = 0.5;

/// Extra backoff factor for connection-level failures.
pub const NETWORK_ERROR_BACKOFF_FACTOR: f64 = 1.5;

/// Per-request timeout before library and page-count multipliers (30 seconds).
pub const BASE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lower bound for any computed request timeout.
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for any computed request timeout (10 minutes).
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// DNS cache lifetime for ordinary hosts (5 minutes).
pub const DNS_DEFAULT_TTL: Duration = Duration::from_secs(300);

/// DNS cache lifetime for hosts that resolve slowly (15 minutes).
pub const DNS_SLOW_TTL: Duration = Duration::from_secs(900);

/// Resolution latency above which a host counts as slow to resolve.
pub const DNS_SLOW_RESOLUTION: Duration = Duration::from_secs(1);

/// Concurrent requests allowed per host.
pub const MAX_CONNECTIONS_PER_HOST: usize = 6;

/// Idle keep-alive connections kept per host.
pub const MAX_IDLE_PER_HOST: usize = 3;

/// Keep-alive idle timeout (30 seconds).
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Host pools unused for this long are evicted (10 minutes).
pub const STALE_POOL_AFTER: Duration = Duration::from_secs(600);

/// HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Warning threshold for cumulative rate limit delay per host (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After honoured (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

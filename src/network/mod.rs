//! Network resilience for outbound library requests.
//!
//! [`NetworkResilience`] combines a per-host [`CircuitBreaker`], a classified
//! [`RetryPolicy`], a [`TimeoutCalculator`], a [`DnsCache`], a per-host
//! [`ConnectionPool`], and a [`RateLimiter`] behind a single
//! [`execute`](NetworkResilience::execute) entry point.

mod circuit_breaker;
pub mod constants;
mod dns_cache;
mod error;
mod pool;
mod rate_limiter;
mod retry;
mod service;
mod timeout;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitRejection, CircuitSnapshot,
    CircuitState,
};
pub use dns_cache::{DnsCache, DnsCacheStats, Resolver, SystemResolver};
pub use error::{NetworkError, NetworkErrorKind, ResilienceError, classify_status};
pub use pool::{ConnectionPool, HostPoolStats, PooledClient, USER_AGENT};
pub use rate_limiter::{RateLimiter, extract_host, parse_retry_after};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{NetworkHealth, NetworkResilience, NetworkResilienceBuilder, RequestContext};
pub use timeout::TimeoutCalculator;

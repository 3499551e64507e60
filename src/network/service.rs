//! The resilience pipeline every outbound request goes through.
//!
//! For each attempt [`NetworkResilience::execute`] runs:
//! 1. per-host rate limit gate
//! 2. circuit breaker admission (fast-fails while OPEN)
//! 3. cached DNS resolution
//! 4. circuit re-check, since the lookup may have suspended
//! 5. pooled client checkout
//! 6. the caller's operation
//!
//! Steps 3 to 6 share one deadline computed by the [`TimeoutCalculator`].
//!
//! The outcome is classified and recorded against the host's circuit. Retryable
//! failures back off and try again until the retry budget runs out or the
//! circuit opens.

use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitRejection, CircuitSnapshot,
    CircuitState,
};
use super::constants::MAX_CONNECTIONS_PER_HOST;
use super::dns_cache::{DnsCache, DnsCacheStats, Resolver, SystemResolver};
use super::error::{NetworkError, ResilienceError};
use super::pool::{ConnectionPool, HostPoolStats};
use super::rate_limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy};
use super::timeout::TimeoutCalculator;
use crate::config::MonitoringConfig;

/// What a request is for; drives the per-call timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Library name, if the request belongs to a known library.
    pub library: Option<String>,
    /// Page count of the manuscript being fetched (0 if unknown).
    pub total_pages: u32,
}

impl RequestContext {
    #[must_use]
    pub fn for_library(library: impl Into<String>, total_pages: u32) -> Self {
        Self {
            library: Some(library.into()),
            total_pages,
        }
    }
}

/// Combined health view of circuits, pools, and the DNS cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkHealth {
    pub circuits: Vec<CircuitSnapshot>,
    pub pools: Vec<HostPoolStats>,
    pub dns: DnsCacheStats,
}

/// Builder for [`NetworkResilience`].
#[derive(Debug)]
pub struct NetworkResilienceBuilder {
    config: Arc<MonitoringConfig>,
    retry: RetryPolicy,
    circuit: CircuitBreakerConfig,
    resolver: Arc<dyn Resolver>,
    timeout_bounds: Option<(Duration, Duration, Duration)>,
    min_request_interval: Duration,
    max_connections_per_host: usize,
}

impl NetworkResilienceBuilder {
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn circuit_breaker(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Base, minimum, and maximum per-request timeout.
    #[must_use]
    pub fn timeout_bounds(mut self, base: Duration, min: Duration, max: Duration) -> Self {
        self.timeout_bounds = Some((base, min, max));
        self
    }

    #[must_use]
    pub fn min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    #[must_use]
    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = max;
        self
    }

    #[must_use]
    pub fn build(self) -> NetworkResilience {
        let mut timeouts = TimeoutCalculator::new(self.config);
        if let Some((base, min, max)) = self.timeout_bounds {
            timeouts = timeouts.with_bounds(base, min, max);
        }
        NetworkResilience {
            circuits: CircuitBreaker::new(self.circuit),
            retry: self.retry,
            timeouts,
            dns: Arc::new(DnsCache::new(self.resolver)),
            pool: ConnectionPool::new(self.max_connections_per_host),
            rate_limiter: RateLimiter::new(self.min_request_interval),
        }
    }
}

/// Resilience layer wrapping every outbound request.
///
/// Construct once and share behind `Arc`.
#[derive(Debug)]
pub struct NetworkResilience {
    circuits: CircuitBreaker,
    retry: RetryPolicy,
    timeouts: TimeoutCalculator,
    dns: Arc<DnsCache>,
    pool: ConnectionPool,
    rate_limiter: RateLimiter,
}

impl NetworkResilience {
    /// Layer with default thresholds and the system resolver.
    #[must_use]
    pub fn new(config: Arc<MonitoringConfig>) -> Self {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn builder(config: Arc<MonitoringConfig>) -> NetworkResilienceBuilder {
        NetworkResilienceBuilder {
            config,
            retry: RetryPolicy::default(),
            circuit: CircuitBreakerConfig::default(),
            resolver: Arc::new(SystemResolver),
            timeout_bounds: None,
            min_request_interval: Duration::ZERO,
            max_connections_per_host: MAX_CONNECTIONS_PER_HOST,
        }
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuits
    }

    #[must_use]
    pub fn dns_cache(&self) -> &Arc<DnsCache> {
        &self.dns
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    #[must_use]
    pub fn timeouts(&self) -> &TimeoutCalculator {
        &self.timeouts
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs `op` against `url` under rate limiting, circuit breaking, DNS
    /// caching, pooling, timeouts, and retries.
    ///
    /// `op` receives the pooled client for the host and the parsed URL, and
    /// is called once per attempt.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::CircuitOpen`] when the host's circuit refuses the
    ///   call; no request is sent.
    /// - [`ResilienceError::Network`] with the last classified failure once
    ///   retrying stops.
    /// - [`ResilienceError::InvalidUrl`] for unparseable or host-less URLs.
    #[instrument(skip(self, op), fields(library = ctx.library.as_deref()))]
    pub async fn execute<T, F, Fut>(
        &self,
        url: &str,
        ctx: &RequestContext,
        mut op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(Client, Url) -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        let parsed = Url::parse(url).map_err(|_| ResilienceError::InvalidUrl {
            url: url.to_string(),
        })?;
        let host = parsed
            .host_str()
            .map(str::to_lowercase)
            .ok_or_else(|| ResilienceError::InvalidUrl {
                url: url.to_string(),
            })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.acquire(&host).await;
            let permit = self.admit(&host)?;

            let outcome = self
                .attempt(&host, &parsed, ctx, permit.state(), &mut op)
                .await;
            let error = match outcome {
                Ok(value) => {
                    permit.succeed();
                    if attempt > 1 {
                        info!(host = %host, attempt, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(AttemptError::Rejected(rejection)) => {
                    return Err(circuit_open(&host, rejection.retry_in));
                }
                Err(AttemptError::Failed(error)) => error,
            };

            let delay = self.after_failure(&host, permit, error, attempt).await?;
            tokio::time::sleep(delay).await;
        }
    }

    /// GETs `url` and returns the response once its status is a success.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute). Non-success statuses are classified as
    /// HTTP failures.
    pub async fn get(
        &self,
        url: &str,
        ctx: &RequestContext,
    ) -> Result<reqwest::Response, ResilienceError> {
        self.execute(url, ctx, |client, url| async move { send_get(&client, url).await })
            .await
    }

    /// GETs `url` and reads the whole body inside the attempt's timeout.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn fetch_bytes(
        &self,
        url: &str,
        ctx: &RequestContext,
    ) -> Result<Vec<u8>, ResilienceError> {
        self.execute(url, ctx, |client, url| async move {
            let response = send_get(&client, url.clone()).await?;
            let body = response
                .bytes()
                .await
                .map_err(|e| NetworkError::request(url.as_str(), e))?;
            Ok::<_, NetworkError>(body.to_vec())
        })
        .await
    }

    #[must_use]
    pub fn health_snapshot(&self) -> NetworkHealth {
        NetworkHealth {
            circuits: self.circuits.snapshot(),
            pools: self.pool.stats(),
            dns: self.dns.stats(),
        }
    }

    /// Sweeps expired DNS entries and stale host pools every `interval`
    /// until the handle is aborted or the layer is dropped.
    #[must_use]
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let layer: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(layer) = layer.upgrade() else {
                    return;
                };
                let dns = layer.dns.sweep();
                let pools = layer.pool.sweep_idle();
                debug!(dns, pools, "network maintenance sweep");
            }
        })
    }

    fn admit(&self, host: &str) -> Result<CircuitPermit<'_>, ResilienceError> {
        self.circuits.acquire(host).map_err(|rejection| {
            debug!(host, state = %rejection.state, "circuit rejected request");
            circuit_open(host, rejection.retry_in)
        })
    }

    /// One pass through DNS, pool, and the operation, all under the
    /// request timeout.
    async fn attempt<T, F, Fut>(
        &self,
        host: &str,
        url: &Url,
        ctx: &RequestContext,
        state: CircuitState,
        op: &mut F,
    ) -> Result<T, AttemptError>
    where
        F: FnMut(Client, Url) -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        let timeout = self
            .timeouts
            .request_timeout(ctx.library.as_deref(), ctx.total_pages, state);
        let started = Instant::now();
        let remaining = || timeout.saturating_sub(started.elapsed());

        let addresses: Vec<IpAddr> = if host_is_ip_literal(url) {
            Vec::new()
        } else {
            tokio::time::timeout(remaining(), self.dns.resolve(host))
                .await
                .map_err(|_| {
                    NetworkError::dns(
                        host,
                        format!("lookup timed out after {}ms", timeout.as_millis()),
                    )
                })??
        };

        // The lookup may have suspended while another task opened the circuit.
        if self.circuits.state(host) == CircuitState::Open {
            let retry_in = self
                .circuits
                .status(host)
                .and_then(|status| status.retry_in)
                .unwrap_or_default();
            return Err(AttemptError::Rejected(CircuitRejection {
                state: CircuitState::Open,
                retry_in,
            }));
        }

        let lease = tokio::time::timeout(remaining(), self.pool.checkout(host, &addresses))
            .await
            .map_err(|_| NetworkError::timeout(url.as_str(), timeout))??;

        let op_started = Instant::now();
        let result =
            match tokio::time::timeout(remaining(), op(lease.client().clone(), url.clone())).await
            {
                Ok(result) => result,
                Err(_) => Err(NetworkError::timeout(url.as_str(), timeout)),
            };
        lease.record(op_started.elapsed(), result.is_ok());
        result.map_err(AttemptError::Failed)
    }

    /// Records a failed attempt and returns the backoff before the next one.
    async fn after_failure(
        &self,
        host: &str,
        permit: CircuitPermit<'_>,
        error: NetworkError,
        attempt: u32,
    ) -> Result<Duration, ResilienceError> {
        let kind = error.kind();
        permit.fail(kind);

        // Retry-After on 429 or 503 blocks the host for every caller.
        if let Some(server_delay) = error.retry_after() {
            self.rate_limiter.record_rate_limit(host, server_delay).await;
        }

        if self.circuits.state(host) == CircuitState::Open {
            warn!(host, attempt, %kind, error = %error, "circuit open, not retrying");
            return Err(ResilienceError::Network {
                attempts: attempt,
                source: error,
            });
        }

        match self.retry.should_retry(&error, attempt) {
            RetryDecision::Retry { delay, attempt: next } => {
                warn!(
                    host,
                    attempt,
                    next_attempt = next,
                    delay_ms = delay.as_millis(),
                    %kind,
                    error = %error,
                    "request failed, retrying"
                );
                Ok(delay)
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(host, attempt, %kind, error = %error, reason = %reason, "request failed");
                Err(ResilienceError::Network {
                    attempts: attempt,
                    source: error,
                })
            }
        }
    }
}

enum AttemptError {
    Rejected(CircuitRejection),
    Failed(NetworkError),
}

impl From<NetworkError> for AttemptError {
    fn from(error: NetworkError) -> Self {
        Self::Failed(error)
    }
}

fn circuit_open(host: &str, retry_in: Duration) -> ResilienceError {
    ResilienceError::CircuitOpen {
        host: host.to_string(),
        retry_in,
    }
}

fn host_is_ip_literal(url: &Url) -> bool {
    matches!(url.host(), Some(url::Host::Ipv4(_) | url::Host::Ipv6(_)))
}

async fn send_get(client: &Client, url: Url) -> Result<reqwest::Response, NetworkError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| NetworkError::request(url.as_str(), e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    Err(NetworkError::http_status_with_retry_after(
        url.as_str(),
        status.as_u16(),
        retry_after,
    ))
}

//! Per-host keep-alive clients with bounded concurrency.
//!
//! Each host gets its own `reqwest::Client` (so idle connections and DNS
//! pinning are per host) and a semaphore capping concurrent requests at
//! [`MAX_CONNECTIONS_PER_HOST`]. A [`PooledClient`] holds one permit for the
//! lifetime of a request.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::constants::{
    CONNECT_TIMEOUT, MAX_CONNECTIONS_PER_HOST, MAX_IDLE_PER_HOST, POOL_IDLE_TIMEOUT,
    STALE_POOL_AFTER,
};
use super::error::NetworkError;

/// User-Agent sent on every pooled request.
pub const USER_AGENT: &str = concat!("manuscript-monitor/", env!("CARGO_PKG_VERSION"));

const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Request counters for one host.
#[derive(Debug, Default)]
struct HostStats {
    total_requests: AtomicU64,
    failures: AtomicU64,
    total_response_ms: AtomicU64,
    /// Milliseconds since the pool epoch.
    last_used_ms: AtomicU64,
}

#[derive(Debug, Clone)]
struct HostPool {
    client: Client,
    pinned: Vec<IpAddr>,
    semaphore: Arc<Semaphore>,
    stats: Arc<HostStats>,
}

/// Per-host view returned by [`ConnectionPool::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostPoolStats {
    pub host: String,
    pub total_requests: u64,
    pub failures: u64,
    pub average_response_time: Duration,
    pub active_connections: usize,
    pub idle_for: Duration,
}

/// A client checked out for one request; holds a concurrency permit until dropped.
#[derive(Debug)]
pub struct PooledClient {
    client: Client,
    stats: Arc<HostStats>,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Records the outcome of the request made with this client.
    #[allow(clippy::cast_possible_truncation)]
    pub fn record(&self, elapsed: Duration, success: bool) {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_response_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if !success {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Host-keyed pool of HTTP clients, shared behind `Arc`.
#[derive(Debug)]
pub struct ConnectionPool {
    hosts: DashMap<String, HostPool>,
    max_connections: usize,
    epoch: Instant,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(MAX_CONNECTIONS_PER_HOST)
    }
}

impl ConnectionPool {
    /// `max_connections` is clamped to at least 1.
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            hosts: DashMap::new(),
            max_connections: max_connections.max(1),
            epoch: Instant::now(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Checks out the client for `host`, waiting for a free connection slot.
    ///
    /// `addresses` pins resolution for `host`; an empty slice leaves resolution
    /// to the client (used for IP literals). A changed address set rebuilds
    /// the host's client.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Connection`] if the client cannot be built.
    #[instrument(level = "debug", skip(self, addresses))]
    pub async fn checkout(
        &self,
        host: &str,
        addresses: &[IpAddr],
    ) -> Result<PooledClient, NetworkError> {
        let pool = {
            let mut entry = match self.hosts.get_mut(host) {
                Some(entry) => entry,
                None => {
                    let client = build_client(host, addresses)?;
                    self.hosts
                        .entry(host.to_string())
                        .or_insert_with(|| HostPool {
                            client,
                            pinned: addresses.to_vec(),
                            semaphore: Arc::new(Semaphore::new(self.max_connections)),
                            stats: Arc::new(HostStats::default()),
                        })
                }
            };
            if entry.pinned != addresses {
                debug!(host, "addresses changed, rebuilding client");
                entry.client = build_client(host, addresses)?;
                entry.pinned = addresses.to_vec();
            }
            entry.stats.last_used_ms.store(self.now_ms(), Ordering::Relaxed);
            entry.clone()
        };

        let permit = Arc::clone(&pool.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| NetworkError::connection(host, "connection pool closed"))?;
        Ok(PooledClient {
            client: pool.client,
            stats: pool.stats,
            _permit: permit,
        })
    }

    /// Evicts host pools idle for longer than the stale threshold with no
    /// request in flight. Returns how many were evicted.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_older_than(STALE_POOL_AFTER)
    }

    fn sweep_idle_older_than(&self, max_idle: Duration) -> usize {
        let now_ms = self.now_ms();
        let before = self.hosts.len();
        self.hosts.retain(|host, pool| {
            let idle_ms = now_ms.saturating_sub(pool.stats.last_used_ms.load(Ordering::Relaxed));
            let busy = pool.semaphore.available_permits() < self.max_connections;
            let keep = busy || Duration::from_millis(idle_ms) <= max_idle;
            if !keep {
                info!(host = %host, idle_secs = idle_ms / 1000, "evicted stale connection pool");
            }
            keep
        });
        before.saturating_sub(self.hosts.len())
    }

    /// Counters for every pooled host, sorted by host.
    #[must_use]
    pub fn stats(&self) -> Vec<HostPoolStats> {
        let now_ms = self.now_ms();
        let mut all: Vec<HostPoolStats> = self
            .hosts
            .iter()
            .map(|entry| {
                let stats = &entry.stats;
                let total_requests = stats.total_requests.load(Ordering::Relaxed);
                let total_ms = stats.total_response_ms.load(Ordering::Relaxed);
                HostPoolStats {
                    host: entry.key().clone(),
                    total_requests,
                    failures: stats.failures.load(Ordering::Relaxed),
                    average_response_time: Duration::from_millis(
                        total_ms.checked_div(total_requests).unwrap_or(0),
                    ),
                    active_connections: self
                        .max_connections
                        .saturating_sub(entry.semaphore.available_permits()),
                    idle_for: Duration::from_millis(
                        now_ms.saturating_sub(stats.last_used_ms.load(Ordering::Relaxed)),
                    ),
                }
            })
            .collect();
        all.sort_by(|a, b| a.host.cmp(&b.host));
        all
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn build_client(host: &str, addresses: &[IpAddr]) -> Result<Client, NetworkError> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .tcp_keepalive(TCP_KEEPALIVE);
    if !addresses.is_empty() {
        // Port 0 keeps the URL's own port.
        let socket_addrs: Vec<SocketAddr> = addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, 0))
            .collect();
        builder = builder.resolve_to_addrs(host, &socket_addrs);
    }
    builder
        .build()
        .map_err(|e| NetworkError::connection(host, format!("failed to build HTTP client: {e}")))
}

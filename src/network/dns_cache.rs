//! Host name resolution cache with latency-adaptive TTL.
//!
//! Entries live for [`DNS_DEFAULT_TTL`]; hosts whose resolution took longer
//! than [`DNS_SLOW_RESOLUTION`] are kept for [`DNS_SLOW_TTL`] instead.
//! Expired entries are ignored on lookup and removed by [`DnsCache::sweep`],
//! which [`DnsCache::spawn_sweeper`] runs periodically.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::constants::{DNS_DEFAULT_TTL, DNS_SLOW_RESOLUTION, DNS_SLOW_TTL};
use super::error::NetworkError;

/// Resolves host names to addresses.
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[derive(Debug, Clone)]
struct DnsEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

/// Counters exposed by [`DnsCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DnsCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before any lookup.
    pub hit_rate: f64,
}

/// Caching resolver shared behind `Arc`.
#[derive(Debug)]
pub struct DnsCache {
    resolver: Arc<dyn Resolver>,
    entries: DashMap<String, DnsEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemResolver))
    }
}

impl DnsCache {
    #[must_use]
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Addresses for `host`, from cache when fresh.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Dns`] when resolution fails or yields no address.
    #[instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, NetworkError> {
        if let Some(entry) = self.entries.get(host)
            && entry.expires_at > Instant::now()
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.addresses.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let addresses = self
            .resolver
            .resolve(host)
            .await
            .map_err(|e| NetworkError::dns(host, e.to_string()))?;
        if addresses.is_empty() {
            return Err(NetworkError::dns(host, "no addresses returned"));
        }

        let latency = started.elapsed();
        let ttl = if latency > DNS_SLOW_RESOLUTION {
            DNS_SLOW_TTL
        } else {
            DNS_DEFAULT_TTL
        };
        debug!(
            host,
            addresses = addresses.len(),
            latency_ms = latency.as_millis(),
            ttl_secs = ttl.as_secs(),
            "resolved host"
        );
        self.entries.insert(
            host.to_string(),
            DnsEntry {
                addresses: addresses.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(addresses)
    }

    /// Drops the cached entry for `host`.
    pub fn invalidate(&self, host: &str) -> bool {
        self.entries.remove(host).is_some()
    }

    /// Removes expired entries and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        debug!(removed, remaining = self.entries.len(), "DNS cache swept");
        removed
    }

    #[must_use]
    pub fn stats(&self) -> DnsCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        DnsCacheStats {
            entries: self.entries.len(),
            hits,
            misses,
            hit_rate,
        }
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the returned handle
    /// is aborted or the cache is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    return;
                };
                cache.sweep();
            }
        })
    }
}

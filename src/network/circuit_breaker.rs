//! Per-host circuit breaker.
//!
//! Each host moves through CLOSED → OPEN → HALF_OPEN → CLOSED/OPEN:
//! - CLOSED admits every call. [`FAILURE_THRESHOLD`] consecutive retryable
//!   failures open the circuit.
//! - OPEN rejects calls without touching the network until
//!   [`RECOVERY_TIMEOUT`] has elapsed since it opened.
//! - HALF_OPEN admits up to [`HALF_OPEN_MAX_CALLS`] probes. The first probe
//!   outcome decides: success closes the circuit, failure re-opens it with the
//!   recovery clock restarted. A probe abandoned before it settles (its
//!   [`CircuitPermit`] dropped unresolved) hands its slot back.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::constants::{
    FAILURE_THRESHOLD, HALF_OPEN_MAX_CALLS, HALF_OPEN_RETRY_HINT, RECOVERY_TIMEOUT,
};
use super::error::NetworkErrorKind;

/// Circuit state for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            recovery_timeout: RECOVERY_TIMEOUT,
            half_open_max_calls: HALF_OPEN_MAX_CALLS,
        }
    }
}

/// A call was refused because the host's circuit is not admitting traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRejection {
    pub state: CircuitState,
    /// How long until the circuit may admit a call again.
    pub retry_in: Duration,
}

/// Admission to call one host, from [`CircuitBreaker::acquire`].
///
/// Resolve it with [`succeed`](Self::succeed) or [`fail`](Self::fail). A
/// HALF_OPEN permit dropped unresolved returns its probe slot.
#[derive(Debug)]
#[must_use = "an unresolved permit records no outcome"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    host: String,
    state: CircuitState,
    resolved: bool,
}

impl CircuitPermit<'_> {
    /// State the call was admitted under.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record_success(&self.host);
    }

    pub fn fail(mut self, kind: NetworkErrorKind) {
        self.resolved = true;
        self.breaker.record_failure(&self.host, kind);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.state == CircuitState::HalfOpen {
            self.breaker.release_probe(&self.host);
        }
    }
}

/// Point-in-time view of one host's circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub host: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time since the most recent recorded failure.
    pub since_last_failure: Option<Duration>,
    /// Remaining wait while OPEN.
    pub retry_in: Option<Duration>,
    pub half_open_probes_remaining: u32,
}

#[derive(Debug)]
struct HostCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_probes_remaining: u32,
}

impl HostCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            half_open_probes_remaining: 0,
        }
    }

    fn retry_in(&self, recovery: Duration, now: Instant) -> Option<Duration> {
        (self.state == CircuitState::Open).then(|| {
            let elapsed = self
                .opened_at
                .map_or(recovery, |opened| now.saturating_duration_since(opened));
            recovery.saturating_sub(elapsed)
        })
    }
}

/// Circuit breaker keyed by host name.
///
/// Shared behind `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, HostCircuit>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Asks permission to call `host`.
    ///
    /// Returns the state the call runs under. An OPEN circuit whose recovery
    /// timeout has elapsed moves to HALF_OPEN here and the call becomes a probe.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitRejection`] when the circuit is OPEN, or HALF_OPEN with
    /// every probe slot taken.
    #[instrument(level = "trace", skip(self))]
    pub fn try_acquire(&self, host: &str) -> Result<CircuitState, CircuitRejection> {
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(host.to_string())
            .or_insert_with(HostCircuit::new);

        match circuit.state {
            CircuitState::Closed => Ok(CircuitState::Closed),
            CircuitState::Open => {
                let remaining = circuit
                    .retry_in(self.config.recovery_timeout, now)
                    .unwrap_or_default();
                if remaining.is_zero() {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_probes_remaining =
                        self.config.half_open_max_calls.saturating_sub(1);
                    info!(host, "circuit half-open, probing");
                    Ok(CircuitState::HalfOpen)
                } else {
                    Err(CircuitRejection {
                        state: CircuitState::Open,
                        retry_in: remaining,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if circuit.half_open_probes_remaining > 0 {
                    circuit.half_open_probes_remaining -= 1;
                    Ok(CircuitState::HalfOpen)
                } else {
                    Err(CircuitRejection {
                        state: CircuitState::HalfOpen,
                        retry_in: HALF_OPEN_RETRY_HINT,
                    })
                }
            }
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), but returns a permit that
    /// records the call's outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitRejection`] when the circuit does not admit the call.
    pub fn acquire(&self, host: &str) -> Result<CircuitPermit<'_>, CircuitRejection> {
        let state = self.try_acquire(host)?;
        Ok(CircuitPermit {
            breaker: self,
            host: host.to_string(),
            state,
            resolved: false,
        })
    }

    /// Returns a probe slot taken by a call that never reported an outcome.
    fn release_probe(&self, host: &str) {
        let Some(mut circuit) = self.circuits.get_mut(host) else {
            return;
        };
        if circuit.state == CircuitState::HalfOpen
            && circuit.half_open_probes_remaining < self.config.half_open_max_calls
        {
            circuit.half_open_probes_remaining += 1;
            debug!(host, "probe abandoned, slot returned");
        }
    }

    /// Records a successful call. Closes a HALF_OPEN circuit.
    #[instrument(level = "trace", skip(self))]
    pub fn record_success(&self, host: &str) {
        let Some(mut circuit) = self.circuits.get_mut(host) else {
            return;
        };
        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Closed;
                circuit.consecutive_failures = 0;
                circuit.opened_at = None;
                circuit.half_open_probes_remaining = 0;
                info!(host, "circuit closed, host recovered");
            }
            CircuitState::Closed => circuit.consecutive_failures = 0,
            // A straggler from before the circuit opened does not close it.
            CircuitState::Open => {}
        }
    }

    /// Records a failed call of class `kind`.
    ///
    /// Non-retryable failures (4xx) prove the host is reachable and reset the
    /// consecutive count instead of adding to it.
    #[instrument(level = "trace", skip(self))]
    pub fn record_failure(&self, host: &str, kind: NetworkErrorKind) {
        if !kind.is_retryable() {
            self.record_success(host);
            return;
        }

        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(host.to_string())
            .or_insert_with(HostCircuit::new);
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        circuit.last_failure = Some(now);

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                circuit.half_open_probes_remaining = 0;
                warn!(host, %kind, "probe failed, circuit re-opened");
            }
            CircuitState::Closed
                if circuit.consecutive_failures >= self.config.failure_threshold =>
            {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                warn!(
                    host,
                    failures = circuit.consecutive_failures,
                    recovery_secs = self.config.recovery_timeout.as_secs(),
                    "circuit opened"
                );
            }
            _ => debug!(
                host,
                %kind,
                failures = circuit.consecutive_failures,
                "failure recorded"
            ),
        }
    }

    /// Current state of `host`'s circuit (CLOSED if never seen).
    #[must_use]
    pub fn state(&self, host: &str) -> CircuitState {
        self.circuits
            .get(host)
            .map_or(CircuitState::Closed, |circuit| circuit.state)
    }

    /// Detailed view of `host`'s circuit, or `None` if it was never used.
    #[must_use]
    pub fn status(&self, host: &str) -> Option<CircuitSnapshot> {
        let now = Instant::now();
        self.circuits
            .get(host)
            .map(|circuit| self.snapshot_of(host, &circuit, now))
    }

    /// Views of every known circuit, sorted by host.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut all: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|entry| self.snapshot_of(entry.key(), entry.value(), now))
            .collect();
        all.sort_by(|a, b| a.host.cmp(&b.host));
        all
    }

    /// Forces `host` back to CLOSED. Returns `false` if the host was unknown.
    #[instrument(skip(self))]
    pub fn reset(&self, host: &str) -> bool {
        let Some(mut circuit) = self.circuits.get_mut(host) else {
            return false;
        };
        *circuit = HostCircuit::new();
        info!(host, "circuit manually reset");
        true
    }

    fn snapshot_of(&self, host: &str, circuit: &HostCircuit, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            host: host.to_string(),
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            since_last_failure: circuit
                .last_failure
                .map(|at| now.saturating_duration_since(at)),
            retry_in: circuit.retry_in(self.config.recovery_timeout, now),
            half_open_probes_remaining: circuit.half_open_probes_remaining,
        }
    }
}

//! Per-request timeout derived from library config, manuscript size, and circuit state.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::circuit_breaker::CircuitState;
use super::constants::{BASE_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT, MIN_REQUEST_TIMEOUT};
use crate::config::{MonitoringConfig, page_count_multiplier};

/// Computes the timeout for one network call.
///
/// ```text
/// timeout = base * library.timeout_multiplier * page_count_multiplier(total_pages)
/// ```
///
/// halved while the host's circuit is HALF_OPEN, then clamped to
/// `[min, max]`.
#[derive(Debug, Clone)]
pub struct TimeoutCalculator {
    config: Arc<MonitoringConfig>,
    base: Duration,
    min: Duration,
    max: Duration,
}

impl TimeoutCalculator {
    #[must_use]
    pub fn new(config: Arc<MonitoringConfig>) -> Self {
        Self {
            config,
            base: BASE_REQUEST_TIMEOUT,
            min: MIN_REQUEST_TIMEOUT,
            max: MAX_REQUEST_TIMEOUT,
        }
    }

    /// Overrides the base and bounds. `min` is capped at `max`.
    #[must_use]
    pub fn with_bounds(mut self, base: Duration, min: Duration, max: Duration) -> Self {
        self.base = base;
        self.min = min.min(max);
        self.max = max;
        self
    }

    /// Timeout for a request to `library` (if known) for a manuscript of `total_pages`.
    #[must_use]
    pub fn request_timeout(
        &self,
        library: Option<&str>,
        total_pages: u32,
        circuit: CircuitState,
    ) -> Duration {
        let library_multiplier = library.map_or(1.0, |library| {
            self.config.get_library_config(library).timeout_multiplier
        });
        let mut seconds = self.base.as_secs_f64()
            * library_multiplier
            * f64::from(page_count_multiplier(total_pages));
        if circuit == CircuitState::HalfOpen {
            seconds /= 2.0;
        }

        let timeout = Duration::try_from_secs_f64(seconds)
            .unwrap_or(self.max)
            .clamp(self.min, self.max);
        trace!(
            library,
            total_pages,
            %circuit,
            timeout_ms = timeout.as_millis(),
            "request timeout computed"
        );
        timeout
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn calculator() -> TimeoutCalculator {
        TimeoutCalculator::new(Arc::new(MonitoringConfig::new()))
    }

    #[test]
    fn test_unknown_library_small_manuscript_uses_base() {
        assert_eq!(
            calculator().request_timeout(None, 10, CircuitState::Closed),
            BASE_REQUEST_TIMEOUT
        );
    }

    #[test]
    fn test_library_and_page_multipliers_compound() {
        // internet_culturale multiplier 2.0, 400 pages -> x3
        assert_eq!(
            calculator().request_timeout(Some("internet_culturale"), 400, CircuitState::Closed),
            Duration::from_secs(180)
        );
    }

    #[test]
    fn test_half_open_halves_timeout() {
        let calc = calculator();
        let closed = calc.request_timeout(Some("gallica"), 250, CircuitState::Closed);
        let probing = calc.request_timeout(Some("gallica"), 250, CircuitState::HalfOpen);
        assert_eq!(probing * 2, closed);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let calc = calculator().with_bounds(
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        assert_eq!(
            calc.request_timeout(None, 10, CircuitState::HalfOpen),
            Duration::from_secs(5)
        );

        let calc = calculator().with_bounds(
            Duration::from_secs(100),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        assert_eq!(
            calc.request_timeout(None, 1000, CircuitState::Closed),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_follows_config_overrides() {
        let config = Arc::new(MonitoringConfig::new());
        let calc = TimeoutCalculator::new(Arc::clone(&config));
        let _guard = config
            .update_library_config(
                "gallica",
                crate::config::LibraryConfigPatch {
                    timeout_multiplier: Some(4.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            calc.request_timeout(Some("gallica"), 10, CircuitState::Closed),
            Duration::from_secs(120)
        );
    }
}

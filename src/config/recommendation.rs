//! Deterministic continue/split/abort policy for in-flight downloads.

use serde::Serialize;
use tracing::{debug, instrument};

use super::MonitoringConfig;

/// Progress fraction under which a large manuscript is still worth splitting.
const SPLIT_PROGRESS_FRACTION: f64 = 0.5;

/// What the caller should do with a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationAction {
    /// Keep downloading.
    Continue,
    /// Split the manuscript into smaller parts.
    Split,
    /// Give up; the download cannot finish in a reasonable time.
    Abort,
}

impl RecommendationAction {
    /// Stable lower-case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Split => "split",
            Self::Abort => "abort",
        }
    }
}

/// Output of [`MonitoringConfig::get_download_recommendation`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadRecommendation {
    pub action: RecommendationAction,
    /// Human-readable explanation for logs and UI.
    pub reason: String,
    /// Set when the download continues below the library's slow threshold.
    pub slow_warning: bool,
}

impl MonitoringConfig {
    /// Recommends how to proceed with a download.
    ///
    /// Rules, first match wins:
    /// 1. `total_pages` above the split threshold and less than half done: split.
    /// 2. Average speed at or above the slow threshold: continue.
    /// 3. ETA unknown or longer than the library's timeout window: abort.
    /// 4. Otherwise continue with a slow warning.
    ///
    /// Slowness alone never produces a split. The same inputs always yield
    /// the same answer.
    #[must_use]
    #[instrument(skip(self))]
    pub fn get_download_recommendation(
        &self,
        library: &str,
        total_pages: u32,
        current_progress: u32,
        average_speed: f64,
        estimated_time_remaining: Option<f64>,
    ) -> DownloadRecommendation {
        let generated = self.generate_monitoring_config(library, total_pages);
        let config = generated.config;

        let recommendation = if total_pages > config.auto_split_threshold_pages
            && f64::from(current_progress) < f64::from(total_pages) * SPLIT_PROGRESS_FRACTION
        {
            DownloadRecommendation {
                action: RecommendationAction::Split,
                reason: format!(
                    "{total_pages} pages exceeds the split threshold of {} for {}",
                    config.auto_split_threshold_pages, generated.library
                ),
                slow_warning: false,
            }
        } else if average_speed >= config.slow_progress_threshold {
            DownloadRecommendation {
                action: RecommendationAction::Continue,
                reason: format!("progressing at {average_speed:.1} pages/min"),
                slow_warning: false,
            }
        } else {
            let window_minutes = generated.effective_timeout.as_secs_f64() / 60.0;
            match estimated_time_remaining {
                Some(eta) if eta.is_finite() && eta <= window_minutes => DownloadRecommendation {
                    action: RecommendationAction::Continue,
                    reason: format!(
                        "slow progress ({average_speed:.1} pages/min, below {:.1}); about {eta:.0} min remaining",
                        config.slow_progress_threshold
                    ),
                    slow_warning: true,
                },
                _ => DownloadRecommendation {
                    action: RecommendationAction::Abort,
                    reason: format!(
                        "slow progress ({average_speed:.1} pages/min) cannot finish within {window_minutes:.0} min"
                    ),
                    slow_warning: true,
                },
            }
        };

        debug!(action = recommendation.action.as_str(), reason = %recommendation.reason, "recommendation");
        recommendation
    }
}

//! Adapter wiring a manuscript downloader into the progress engine.
//!
//! [`ProgressIntegration::wrap_download_manuscript`] opens a session, forwards
//! every raw tick the downloader reports into the engine, hands the caller an
//! enriched tick carrying trend data, and closes the session however the
//! download ends (success, error, panic, or the caller dropping the future).

use std::fmt;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::ProgressMonitor;
use crate::config::normalize_library;

/// Raw progress tick reported by a downloader.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressTick {
    pub current: u32,
    pub total: u32,
    pub percentage: f64,
    pub stage: String,
}

impl ProgressTick {
    /// Builds a tick with the percentage derived from `current / total`.
    #[must_use]
    pub fn new(current: u32, total: u32, stage: impl Into<String>) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            f64::from(current) / f64::from(total) * 100.0
        };
        Self {
            current,
            total,
            percentage,
            stage: stage.into(),
        }
    }
}

/// A raw tick enriched with the session's current trend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnhancedProgress {
    pub current: u32,
    pub total: u32,
    pub percentage: f64,
    pub stage: String,
    pub is_stuck: bool,
    pub is_slow: bool,
    /// Pages per minute.
    pub average_speed: f64,
    /// Minutes; `None` while no speed is known.
    pub estimated_time_remaining: Option<f64>,
}

/// Callback a downloader invokes for every raw tick.
pub type ProgressCallback = Arc<dyn Fn(ProgressTick) + Send + Sync>;

/// Callback the caller receives with trend-enriched ticks.
pub type EnhancedProgressCallback = Arc<dyn Fn(EnhancedProgress) + Send + Sync>;

/// Options handed to [`ManuscriptDownloader::download_manuscript`].
#[derive(Clone, Default)]
pub struct DownloadOptions {
    /// Session id the download is tracked under.
    pub session_id: Option<String>,
    pub on_progress: Option<ProgressCallback>,
    /// Loader-specific options passed through untouched.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("session_id", &self.session_id)
            .field("on_progress", &self.on_progress.is_some())
            .field("extra", &self.extra)
            .finish()
    }
}

/// Options accepted by [`ProgressIntegration::wrap_download_manuscript`].
#[derive(Clone, Default)]
pub struct MonitoredDownloadOptions {
    /// Explicit session id; generated as `{library}-{n}` when absent.
    pub session_id: Option<String>,
    pub on_progress: Option<EnhancedProgressCallback>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl fmt::Debug for MonitoredDownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoredDownloadOptions")
            .field("session_id", &self.session_id)
            .field("on_progress", &self.on_progress.is_some())
            .field("extra", &self.extra)
            .finish()
    }
}

/// A loader able to download one manuscript while reporting progress.
#[async_trait]
pub trait ManuscriptDownloader: Send + Sync {
    type Output: Send;
    type Error: Send;

    /// Downloads `url`, invoking `options.on_progress` as pages arrive.
    async fn download_manuscript(
        &self,
        url: &str,
        options: DownloadOptions,
    ) -> Result<Self::Output, Self::Error>;
}

/// Wraps downloaders so their progress flows through a [`ProgressMonitor`].
#[derive(Debug)]
pub struct ProgressIntegration {
    monitor: ProgressMonitor,
    next_id: AtomicU64,
}

impl ProgressIntegration {
    #[must_use]
    pub fn new(monitor: ProgressMonitor) -> Self {
        Self {
            monitor,
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }

    /// Runs `downloader` under a progress session.
    ///
    /// The session is completed with `success = true` only when the
    /// downloader returns `Ok`. A panicking downloader still completes the
    /// session with `success = false` before the panic is resumed, and so does
    /// dropping the returned future before it finishes.
    ///
    /// # Errors
    ///
    /// Returns the downloader's own error unchanged.
    #[instrument(skip(self, downloader, options), fields(library = %library))]
    pub async fn wrap_download_manuscript<D>(
        &self,
        downloader: &D,
        url: &str,
        library: &str,
        total_pages: u32,
        options: MonitoredDownloadOptions,
    ) -> Result<D::Output, D::Error>
    where
        D: ManuscriptDownloader + ?Sized,
    {
        let session_id = options.session_id.unwrap_or_else(|| {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            format!("{}-{n}", normalize_library(library))
        });
        self.monitor
            .create_session(&session_id, url, library, total_pages);
        let guard = SessionGuard {
            monitor: &self.monitor,
            session_id: &session_id,
            armed: true,
        };

        let monitor = self.monitor.clone();
        let tracked_id = session_id.clone();
        let caller_callback = options.on_progress;
        let on_progress: ProgressCallback = Arc::new(move |tick: ProgressTick| {
            monitor.update_progress(&tracked_id, tick.current, tick.total, &tick.stage);
            let Some(callback) = caller_callback.as_ref() else {
                return;
            };
            let trend = monitor.get_progress_trend(&tracked_id);
            callback(EnhancedProgress {
                is_stuck: trend.as_ref().is_some_and(|t| t.is_stuck),
                is_slow: trend.as_ref().is_some_and(|t| t.is_slow),
                average_speed: trend.as_ref().map_or(0.0, |t| t.average_speed),
                estimated_time_remaining: trend.and_then(|t| t.estimated_time_remaining),
                current: tick.current,
                total: tick.total,
                percentage: tick.percentage,
                stage: tick.stage,
            });
        });

        let download_options = DownloadOptions {
            session_id: Some(session_id.clone()),
            on_progress: Some(on_progress),
            extra: options.extra,
        };
        let outcome = AssertUnwindSafe(downloader.download_manuscript(url, download_options))
            .catch_unwind()
            .await;

        match outcome {
            Ok(result) => {
                let success = result.is_ok();
                debug!(session_id = %session_id, success, "download settled");
                guard.settle(success);
                result
            }
            Err(panic) => {
                warn!(session_id = %session_id, "downloader panicked; closing session");
                guard.settle(false);
                resume_unwind(panic)
            }
        }
    }
}

/// Completes the wrapped session as failed if the download future is dropped
/// before it settles.
struct SessionGuard<'a> {
    monitor: &'a ProgressMonitor,
    session_id: &'a str,
    armed: bool,
}

impl SessionGuard<'_> {
    fn settle(mut self, success: bool) {
        self.armed = false;
        self.monitor.complete_session(self.session_id, success);
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(session_id = %self.session_id, "download dropped before settling; closing session");
            self.monitor.complete_session(self.session_id, false);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::MonitoringConfig;
    use crate::progress::{MonitorEvent, MonitorEventKind};

    struct ScriptedDownloader {
        ticks: Vec<u32>,
        fail: bool,
    }

    #[async_trait]
    impl ManuscriptDownloader for ScriptedDownloader {
        type Output = usize;
        type Error = String;

        async fn download_manuscript(
            &self,
            _url: &str,
            options: DownloadOptions,
        ) -> Result<usize, String> {
            let callback = options.on_progress.unwrap();
            for &current in &self.ticks {
                callback(ProgressTick::new(current, 10, "downloading"));
            }
            if self.fail {
                Err("server closed connection".to_string())
            } else {
                Ok(self.ticks.len())
            }
        }
    }

    fn completions(monitor: &ProgressMonitor) -> Arc<Mutex<Vec<(String, bool)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.on(
            MonitorEventKind::SessionCompleted,
            Arc::new(move |event: &MonitorEvent| {
                if let MonitorEvent::SessionCompleted {
                    session_id, success, ..
                } = event
                {
                    sink.lock().unwrap().push((session_id.clone(), *success));
                }
            }),
        );
        seen
    }

    #[tokio::test]
    async fn test_success_forwards_ticks_and_completes() {
        let integration =
            ProgressIntegration::new(ProgressMonitor::new(Arc::new(MonitoringConfig::new())));
        let seen = completions(integration.monitor());
        let enriched = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&enriched);

        let result = integration
            .wrap_download_manuscript(
                &ScriptedDownloader {
                    ticks: vec![2, 4, 6],
                    fail: false,
                },
                "https://example.org/ms/1",
                "Gallica",
                10,
                MonitoredDownloadOptions {
                    on_progress: Some(Arc::new(move |p: EnhancedProgress| {
                        sink.lock().unwrap().push(p);
                    })),
                    ..MonitoredDownloadOptions::default()
                },
            )
            .await;

        assert_eq!(result, Ok(3));
        let enriched = enriched.lock().unwrap();
        assert_eq!(enriched.len(), 3);
        assert_eq!(enriched[2].current, 6);
        assert!((enriched[2].percentage - 60.0).abs() < 1e-9);
        assert!(!enriched[2].is_stuck);

        assert_eq!(*seen.lock().unwrap(), vec![("gallica-1".to_string(), true)]);
        assert_eq!(integration.monitor().active_count(), 0);
    }

    #[tokio::test]
    async fn test_error_completes_with_failure() {
        let integration =
            ProgressIntegration::new(ProgressMonitor::new(Arc::new(MonitoringConfig::new())));
        let seen = completions(integration.monitor());

        let result = integration
            .wrap_download_manuscript(
                &ScriptedDownloader {
                    ticks: vec![1],
                    fail: true,
                },
                "https://example.org/ms/2",
                "bne",
                10,
                MonitoredDownloadOptions {
                    session_id: Some("job-7".to_string()),
                    ..MonitoredDownloadOptions::default()
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(*seen.lock().unwrap(), vec![("job-7".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_generated_ids_are_distinct() {
        let integration =
            ProgressIntegration::new(ProgressMonitor::new(Arc::new(MonitoringConfig::new())));
        let seen = completions(integration.monitor());
        let downloader = ScriptedDownloader {
            ticks: vec![],
            fail: false,
        };
        for _ in 0..2 {
            integration
                .wrap_download_manuscript(
                    &downloader,
                    "https://example.org/ms",
                    "morgan",
                    5,
                    MonitoredDownloadOptions::default(),
                )
                .await
                .unwrap();
        }
        let ids: Vec<String> = seen.lock().unwrap().iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids, vec!["morgan-1".to_string(), "morgan-2".to_string()]);
    }

    struct HangingDownloader;

    #[async_trait]
    impl ManuscriptDownloader for HangingDownloader {
        type Output = ();
        type Error = String;

        async fn download_manuscript(
            &self,
            _url: &str,
            options: DownloadOptions,
        ) -> Result<(), String> {
            let callback = options.on_progress.unwrap();
            callback(ProgressTick::new(1, 10, "downloading"));
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_download_closes_session() {
        let integration =
            ProgressIntegration::new(ProgressMonitor::new(Arc::new(MonitoringConfig::new())));
        let seen = completions(integration.monitor());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            integration.wrap_download_manuscript(
                &HangingDownloader,
                "https://example.org/ms/3",
                "florence",
                10,
                MonitoredDownloadOptions {
                    session_id: Some("abandoned".to_string()),
                    ..MonitoredDownloadOptions::default()
                },
            ),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(integration.monitor().active_count(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![("abandoned".to_string(), false)]);
    }
}

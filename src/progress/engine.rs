//! Progress monitoring engine tracking one session per in-flight download.
//!
//! This module provides [`ProgressMonitor`], which records bounded snapshot
//! history per download, derives speed/stuck/slow trends on demand, and emits
//! lifecycle events.
//!
//! # Overview
//!
//! - [`create_session`](ProgressMonitor::create_session) computes the effective
//!   timeout and starts a per-session watchdog task.
//! - [`update_progress`](ProgressMonitor::update_progress) appends a snapshot
//!   and re-evaluates stuck detection.
//! - The watchdog fires `Timeout` once when the effective timeout elapses and
//!   periodically re-checks for stalls against the *current* library config.
//! - [`complete_session`](ProgressMonitor::complete_session) and
//!   [`cancel_session`](ProgressMonitor::cancel_session) stop the watchdog and
//!   forget the session. Neither aborts in-flight network requests.
//!
//! Operations on unknown session ids are silent no-ops.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use manuscript_monitor::config::MonitoringConfig;
//! use manuscript_monitor::progress::{MonitorEvent, MonitorEventKind, ProgressMonitor};
//!
//! # async fn example() {
//! let monitor = ProgressMonitor::new(Arc::new(MonitoringConfig::new()));
//! monitor.on(MonitorEventKind::StuckDetected, Arc::new(|event: &MonitorEvent| {
//!     eprintln!("stalled: {}", event.session_id());
//! }));
//!
//! monitor.create_session("ms-1", "https://gallica.bnf.fr/ark:/12148/btv1b", "gallica", 240);
//! monitor.update_progress("ms-1", 12, 240, "downloading");
//! if let Some(trend) = monitor.get_progress_trend("ms-1") {
//!     println!("{:.1} pages/min", trend.average_speed);
//! }
//! monitor.complete_session("ms-1", true);
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::events::{EventBus, EventHandler, ListenerId, MonitorEvent, MonitorEventKind};
use super::session::{DownloadSession, ProgressTrend, SessionStatus};
use crate::config::{LibraryMonitoringConfig, MonitoringConfig, normalize_library};

/// Fastest stall re-check cadence.
const MIN_STUCK_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Slowest stall re-check cadence; bounds how late a shrunk threshold is noticed.
const MAX_STUCK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Progress monitoring engine.
///
/// Cheap to clone; clones share the same sessions and listeners. Construct one
/// per process and pass it to collaborators.
#[derive(Clone, Debug)]
pub struct ProgressMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    config: Arc<MonitoringConfig>,
    sessions: DashMap<String, SessionEntry>,
    events: EventBus,
    generation: AtomicU64,
}

impl fmt::Debug for MonitorInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorInner")
            .field("sessions", &self.sessions.len())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Per-session bookkeeping. Dropping an entry cancels its watchdog.
struct SessionEntry {
    session: DownloadSession,
    /// Distinguishes a re-created session from the one a watchdog was started for.
    generation: u64,
    watchdog: Option<JoinHandle<()>>,
    stuck_reported: bool,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

impl SessionEntry {
    /// Updates stall state and returns the event to emit, if any.
    fn evaluate_stall(
        &mut self,
        now: Instant,
        config: &LibraryMonitoringConfig,
        advanced: bool,
    ) -> Option<MonitorEvent> {
        if advanced {
            if self.stuck_reported {
                self.stuck_reported = false;
                return Some(MonitorEvent::ProgressResumed {
                    session_id: self.session.id.clone(),
                    current: self.current(),
                });
            }
            return None;
        }

        let stalled_for = self.session.stalled_for(now);
        if !self.stuck_reported && stalled_for > config.stuck_threshold() {
            self.stuck_reported = true;
            return Some(MonitorEvent::StuckDetected {
                session_id: self.session.id.clone(),
                library: self.session.library.clone(),
                current: self.current(),
                stalled_for,
            });
        }
        None
    }

    fn current(&self) -> u32 {
        self.session.last_snapshot().map_or(0, |s| s.current)
    }
}

impl ProgressMonitor {
    /// Creates an engine reading thresholds from `config`.
    #[must_use]
    pub fn new(config: Arc<MonitoringConfig>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                sessions: DashMap::new(),
                events: EventBus::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// The configuration this engine reads thresholds from.
    #[must_use]
    pub fn config(&self) -> &Arc<MonitoringConfig> {
        &self.inner.config
    }

    /// Starts tracking a download.
    ///
    /// An existing session with the same `id` is replaced; its watchdog is
    /// cancelled before the new one starts. The watchdog needs a Tokio
    /// runtime; without one the session is tracked but no timeout or
    /// background stall check runs.
    #[instrument(skip(self, url), fields(session_id = %id))]
    pub fn create_session(
        &self,
        id: &str,
        url: &str,
        library: &str,
        total_pages: u32,
    ) -> DownloadSession {
        let generated = self
            .inner
            .config
            .generate_monitoring_config(library, total_pages);

        if let Some((_, previous)) = self.inner.sessions.remove(id) {
            debug!(
                previous_library = %previous.session.library,
                "replacing existing session"
            );
            drop(previous);
        }

        let session = DownloadSession::new(
            id.to_string(),
            url.to_string(),
            normalize_library(library),
            total_pages,
            generated.effective_timeout,
        );
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions.insert(
            id.to_string(),
            SessionEntry {
                session: session.clone(),
                generation,
                watchdog: None,
                stuck_reported: false,
            },
        );

        // Spawned after insertion so the task always finds its entry.
        if let Some(watchdog) = spawn_watchdog(
            Arc::downgrade(&self.inner),
            id.to_string(),
            generation,
            generated.effective_timeout,
        ) {
            match self.inner.sessions.get_mut(id) {
                Some(mut entry) if entry.generation == generation => {
                    entry.watchdog = Some(watchdog);
                }
                _ => watchdog.abort(),
            }
        }

        info!(
            library = %session.library,
            total_pages,
            page_count_multiplier = generated.page_count_multiplier,
            timeout_secs = generated.effective_timeout.as_secs_f64(),
            "progress session created"
        );
        session
    }

    /// Records a progress tick. No-op for unknown ids.
    ///
    /// Does not touch the timeout timer.
    #[instrument(level = "trace", skip(self, stage), fields(session_id = %id))]
    pub fn update_progress(&self, id: &str, current: u32, total: u32, stage: &str) {
        let now = Instant::now();
        let event = {
            let Some(mut entry) = self.inner.sessions.get_mut(id) else {
                debug!("progress update for unknown session ignored");
                return;
            };
            let advanced = entry.session.push_snapshot(current, total, stage, now);
            let config = self.inner.config.get_library_config(&entry.session.library);
            entry.evaluate_stall(now, &config, advanced)
        };

        if let Some(event) = event {
            self.inner.publish(&event);
        }
    }

    /// Derived trend for a session, or `None` if `id` is unknown.
    #[must_use]
    pub fn get_progress_trend(&self, id: &str) -> Option<ProgressTrend> {
        let entry = self.inner.sessions.get(id)?;
        let config = self.inner.config.get_library_config(&entry.session.library);
        Some(entry.session.trend(&config, Instant::now()))
    }

    /// Marks a session finished, emits `SessionCompleted`, and stops tracking it.
    ///
    /// Returns the final session state, or `None` (no event) if `id` is unknown.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn complete_session(&self, id: &str, success: bool) -> Option<DownloadSession> {
        let (_, entry) = self.inner.sessions.remove(id)?;
        let mut session = entry.session.clone();
        let pages_completed = entry.current();
        drop(entry);

        session.status = SessionStatus::Completed;
        let duration = session.start_time.elapsed();
        info!(
            success,
            pages_completed,
            duration_secs = duration.as_secs_f64(),
            "progress session completed"
        );

        self.inner.publish(&MonitorEvent::SessionCompleted {
            session_id: id.to_string(),
            success,
            duration,
            pages_completed,
        });
        Some(session)
    }

    /// Stops tracking a session without emitting completion. No-op for unknown ids.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn cancel_session(&self, id: &str) -> Option<DownloadSession> {
        let (_, entry) = self.inner.sessions.remove(id)?;
        let mut session = entry.session.clone();
        session.status = SessionStatus::Cancelled;
        debug!("progress session cancelled");
        Some(session)
    }

    /// Copy of every tracked session, oldest first.
    #[must_use]
    pub fn get_active_sessions(&self) -> Vec<DownloadSession> {
        let mut sessions: Vec<DownloadSession> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Copy of one tracked session.
    #[must_use]
    pub fn get_session(&self, id: &str) -> Option<DownloadSession> {
        self.inner.sessions.get(id).map(|entry| entry.session.clone())
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Registers `handler` for events of `kind`.
    pub fn on(&self, kind: MonitorEventKind, handler: EventHandler) -> ListenerId {
        self.inner.events.on(kind, handler)
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn off(&self, listener: ListenerId) -> bool {
        self.inner.events.off(listener)
    }

    /// Channel receiving every event emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Cancels every watchdog and forgets all sessions.
    pub fn shutdown(&self) {
        let count = self.inner.sessions.len();
        self.inner.sessions.clear();
        info!(count, "progress monitor shut down");
    }
}

impl MonitorInner {
    fn publish(&self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Timeout { session_id, elapsed, .. } => warn!(
                session_id = %session_id,
                elapsed_secs = elapsed.as_secs_f64(),
                "session exceeded its timeout"
            ),
            MonitorEvent::StuckDetected {
                session_id,
                stalled_for,
                current,
                ..
            } => warn!(
                session_id = %session_id,
                current,
                stalled_secs = stalled_for.as_secs_f64(),
                "session appears stuck"
            ),
            MonitorEvent::ProgressResumed { session_id, current } => {
                info!(session_id = %session_id, current, "session progress resumed");
            }
            MonitorEvent::SessionCompleted { .. } => {}
        }
        self.events.emit(event);
    }

    /// Stall re-check cadence for a session, or `None` if it is gone or replaced.
    fn stuck_check_interval(&self, id: &str, generation: u64) -> Option<Duration> {
        let entry = self.sessions.get(id)?;
        if entry.generation != generation {
            return None;
        }
        let threshold = self
            .config
            .get_library_config(&entry.session.library)
            .stuck_threshold();
        Some((threshold / 4).clamp(MIN_STUCK_CHECK_INTERVAL, MAX_STUCK_CHECK_INTERVAL))
    }

    fn check_stuck(&self, id: &str, generation: u64) {
        let event = {
            let Some(mut entry) = self.sessions.get_mut(id) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            let config = self.config.get_library_config(&entry.session.library);
            entry.evaluate_stall(Instant::now(), &config, false)
        };
        if let Some(event) = event {
            self.publish(&event);
        }
    }

    fn fire_timeout(&self, id: &str, generation: u64) {
        let event = {
            let Some(entry) = self.sessions.get(id) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            MonitorEvent::Timeout {
                session_id: entry.session.id.clone(),
                library: entry.session.library.clone(),
                elapsed: entry.session.start_time.elapsed(),
            }
        };
        self.publish(&event);
    }
}

fn spawn_watchdog(
    inner: Weak<MonitorInner>,
    id: String,
    generation: u64,
    timeout: Duration,
) -> Option<JoinHandle<()>> {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(session_id = %id, "no Tokio runtime; session watchdog disabled");
        return None;
    };
    Some(handle.spawn(run_watchdog(inner, id, generation, timeout)))
}

/// Fires `Timeout` once at the deadline and re-checks stalls until cancelled.
///
/// Holds only a weak reference so an abandoned engine lets the task end.
async fn run_watchdog(inner: Weak<MonitorInner>, id: String, generation: u64, timeout: Duration) {
    let deadline = Instant::now().checked_add(timeout);
    let timeout_sleep = tokio::time::sleep_until(deadline.unwrap_or_else(far_future));
    tokio::pin!(timeout_sleep);
    let mut timeout_pending = deadline.is_some();

    loop {
        let interval = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let Some(interval) = inner.stuck_check_interval(&id, generation) else {
                return;
            };
            interval
        };

        tokio::select! {
            () = &mut timeout_sleep, if timeout_pending => {
                timeout_pending = false;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.fire_timeout(&id, generation);
            }
            () = tokio::time::sleep(interval) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.check_stuck(&id, generation);
            }
        }
    }
}

fn far_future() -> Instant {
    // Roughly 30 years; same convention tokio uses internally.
    let now = Instant::now();
    now.checked_add(Duration::from_secs(86400 * 365 * 30))
        .or_else(|| now.checked_add(Duration::from_secs(86400)))
        .unwrap_or(now)
}

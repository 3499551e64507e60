//! Session, snapshot, and trend types for the progress engine.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::Instant;

use crate::config::LibraryMonitoringConfig;

/// Maximum snapshots retained per session; older ones are dropped first.
pub const SNAPSHOT_RETENTION: usize = 50;

/// One recorded progress observation. Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Monotonic time the snapshot was recorded.
    pub timestamp: Instant,
    /// Wall-clock time, for display only.
    pub recorded_at: SystemTime,
    pub current: u32,
    pub total: u32,
    /// `current / total * 100`, fixed at append time (0 when `total` is 0).
    pub percentage: f64,
    pub stage: String,
}

/// Lifecycle state of a [`DownloadSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
}

/// Live tracking record for one in-flight download.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub id: String,
    pub url: String,
    /// Normalized library name.
    pub library: String,
    pub total_pages: u32,
    /// Retained history, oldest first, at most [`SNAPSHOT_RETENTION`] entries.
    pub snapshots: VecDeque<ProgressSnapshot>,
    pub start_time: Instant,
    pub started_at: SystemTime,
    pub status: SessionStatus,
    /// Timeout fixed at creation from library config and page count.
    pub effective_timeout: Duration,
    last_advance: Option<Instant>,
}

impl DownloadSession {
    pub(crate) fn new(
        id: String,
        url: String,
        library: String,
        total_pages: u32,
        effective_timeout: Duration,
    ) -> Self {
        Self {
            id,
            url,
            library,
            total_pages,
            snapshots: VecDeque::with_capacity(SNAPSHOT_RETENTION),
            start_time: Instant::now(),
            started_at: SystemTime::now(),
            status: SessionStatus::Active,
            effective_timeout,
            last_advance: None,
        }
    }

    /// Most recent snapshot, if any.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<&ProgressSnapshot> {
        self.snapshots.back()
    }

    /// Appends a snapshot and trims history. Returns whether `current` advanced.
    ///
    /// The first snapshot always counts as advancing.
    pub(crate) fn push_snapshot(
        &mut self,
        current: u32,
        total: u32,
        stage: &str,
        now: Instant,
    ) -> bool {
        let advanced = self
            .snapshots
            .back()
            .is_none_or(|previous| current > previous.current);

        let percentage = if total == 0 {
            0.0
        } else {
            f64::from(current) / f64::from(total) * 100.0
        };

        self.snapshots.push_back(ProgressSnapshot {
            timestamp: now,
            recorded_at: SystemTime::now(),
            current,
            total,
            percentage,
            stage: stage.to_string(),
        });
        while self.snapshots.len() > SNAPSHOT_RETENTION {
            self.snapshots.pop_front();
        }

        if advanced {
            self.last_advance = Some(now);
        }
        advanced
    }

    /// Time since the last advancing snapshot, or since session start if none.
    #[must_use]
    pub fn stalled_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_advance.unwrap_or(self.start_time))
    }

    /// Pages per minute between the earliest and latest retained snapshot.
    #[must_use]
    pub fn average_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.snapshots.front(), self.snapshots.back()) else {
            return 0.0;
        };
        let minutes = last
            .timestamp
            .saturating_duration_since(first.timestamp)
            .as_secs_f64()
            / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        f64::from(last.current.saturating_sub(first.current)) / minutes
    }

    /// Derives the trend for this session against `config` at `now`.
    #[must_use]
    pub fn trend(&self, config: &LibraryMonitoringConfig, now: Instant) -> ProgressTrend {
        let average_speed = self.average_speed();
        let (current, total) = self
            .last_snapshot()
            .map_or((0, self.total_pages), |s| (s.current, s.total));

        let estimated_time_remaining = if average_speed > 0.0 {
            Some(f64::from(total.saturating_sub(current)) / average_speed)
        } else {
            None
        };
        let stalled_for = self.stalled_for(now);

        ProgressTrend {
            average_speed,
            is_stuck: stalled_for > config.stuck_threshold(),
            // A single observation carries no speed information.
            is_slow: self.snapshots.len() >= 2
                && average_speed < config.slow_progress_threshold,
            estimated_time_remaining,
            current,
            total,
            stalled_for,
        }
    }
}

/// Speed/stuck/slow/ETA summary derived from one session's snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressTrend {
    /// Pages per minute across the retained history.
    pub average_speed: f64,
    pub is_stuck: bool,
    pub is_slow: bool,
    /// Minutes until completion at the average speed; `None` when speed is zero.
    pub estimated_time_remaining: Option<f64>,
    pub current: u32,
    pub total: u32,
    /// Time since the last advancing snapshot.
    pub stalled_for: Duration,
}

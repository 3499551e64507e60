//! Manuscript Monitor Core Library
//!
//! Progress monitoring and network resilience for downloads of digitized
//! manuscripts from slow or flaky library servers.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Per-library monitoring thresholds, scoped overrides, and the
//!   continue/split/abort recommendation policy
//! - [`progress`] - Session tracking, trend analysis, lifecycle events, and the
//!   downloader integration adapter
//! - [`network`] - Circuit breaker, retry, timeouts, DNS cache, and connection
//!   pooling around every outbound request
//!
//! Construct one [`MonitoringConfig`] at startup, wrap it in `Arc`, and pass it
//! to [`ProgressMonitor::new`] and [`NetworkResilience::new`].

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod network;
pub mod progress;

// Re-export commonly used types
pub use config::{
    ConfigError, ConfigOverrideGuard, DownloadRecommendation, LibraryConfigPatch,
    LibraryMonitoringConfig, MonitoringConfig, RecommendationAction,
};
pub use network::{
    CircuitState, NetworkError, NetworkErrorKind, NetworkResilience, RequestContext,
    ResilienceError, RetryPolicy,
};
pub use progress::{
    DownloadSession, ManuscriptDownloader, MonitorEvent, MonitorEventKind, ProgressIntegration,
    ProgressMonitor, ProgressTrend,
};

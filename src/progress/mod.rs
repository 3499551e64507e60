//! Progress tracking for in-flight manuscript downloads.

mod engine;
mod events;
mod integration;
mod session;

pub use engine::ProgressMonitor;
pub use events::{EventHandler, ListenerId, MonitorEvent, MonitorEventKind};
pub use integration::{
    DownloadOptions, EnhancedProgress, EnhancedProgressCallback, ManuscriptDownloader,
    MonitoredDownloadOptions, ProgressCallback, ProgressIntegration, ProgressTick,
};
pub use session::{
    DownloadSession, ProgressSnapshot, ProgressTrend, SNAPSHOT_RETENTION, SessionStatus,
};

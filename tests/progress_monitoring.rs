//! End-to-end behaviour of the progress engine, library config, and adapter.
//!
//! Stall and timeout tests shrink thresholds through scoped config overrides
//! and run on real time; speed tests use paused Tokio time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use manuscript_monitor::config::{LibraryConfigPatch, MonitoringConfig, RecommendationAction};
use manuscript_monitor::progress::{
    DownloadOptions, EnhancedProgress, ManuscriptDownloader, MonitorEvent, MonitorEventKind,
    MonitoredDownloadOptions, ProgressIntegration, ProgressMonitor, ProgressTick,
    SNAPSHOT_RETENTION,
};
use tokio::sync::broadcast;

const EVENT_WAIT: Duration = Duration::from_secs(2);

fn monitor() -> ProgressMonitor {
    ProgressMonitor::new(Arc::new(MonitoringConfig::new()))
}

/// Waits for the next event of `kind`, ignoring others.
async fn next_event(
    rx: &mut broadcast::Receiver<MonitorEvent>,
    kind: MonitorEventKind,
) -> Option<MonitorEvent> {
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if event.kind() == kind => return Some(event),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

// ====== Session Lifecycle Tests ======

#[tokio::test]
async fn test_created_session_is_empty_and_listed_once() {
    let monitor = monitor();
    let session = monitor.create_session(
        "gallica-btv1b",
        "https://gallica.bnf.fr/ark:/12148/btv1b",
        "gallica",
        120,
    );

    assert!(session.snapshots.is_empty());
    let active = monitor.get_active_sessions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "gallica-btv1b");
}

#[tokio::test]
async fn test_snapshot_history_is_capped_and_tracks_last_call() {
    let monitor = monitor();
    monitor.create_session("s", "https://example.org/ms", "bne", 500);

    let calls = SNAPSHOT_RETENTION + 15;
    for i in 1..=calls {
        let current = u32::try_from(i).unwrap();
        monitor.update_progress("s", current, 500, "downloading");
    }

    let session = monitor.get_session("s").unwrap();
    assert_eq!(session.snapshots.len(), SNAPSHOT_RETENTION);
    let last = session.snapshots.back().unwrap();
    let expected = u32::try_from(calls).unwrap();
    assert_eq!(last.current, expected);
    assert!((last.percentage - f64::from(expected) / 500.0 * 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_few_updates_keep_every_snapshot() {
    let monitor = monitor();
    monitor.create_session("s", "https://example.org/ms", "bne", 10);
    for current in [1, 2, 3] {
        monitor.update_progress("s", current, 10, "downloading");
    }
    assert_eq!(monitor.get_session("s").unwrap().snapshots.len(), 3);
}

#[tokio::test]
async fn test_unknown_session_operations_are_silent() {
    let monitor = monitor();
    monitor.update_progress("ghost", 1, 10, "downloading");
    assert!(monitor.complete_session("ghost", true).is_none());
    assert!(monitor.cancel_session("ghost").is_none());
    assert!(monitor.get_progress_trend("ghost").is_none());
    assert!(monitor.get_active_sessions().is_empty());
}

#[tokio::test]
async fn test_completed_and_cancelled_sessions_leave_remainder() {
    let monitor = monitor();
    let ids: Vec<String> = (0..12).map(|i| format!("ms-{i}")).collect();
    for id in &ids {
        monitor.create_session(id, "https://example.org/ms", "morgan", 50);
    }

    for id in &ids[0..4] {
        monitor.complete_session(id, true);
    }
    for id in &ids[4..7] {
        monitor.cancel_session(id);
    }

    let mut remaining: Vec<String> = monitor
        .get_active_sessions()
        .into_iter()
        .map(|s| s.id)
        .collect();
    remaining.sort();
    let mut expected: Vec<String> = ids[7..].to_vec();
    expected.sort();
    assert_eq!(remaining, expected);
}

#[tokio::test]
async fn test_concurrent_updates_on_independent_sessions() {
    let monitor = monitor();
    let mut handles = Vec::new();
    for n in 0..8_u32 {
        let monitor = monitor.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("concurrent-{n}");
            monitor.create_session(&id, "https://example.org/ms", "vatican", 100);
            for current in 1..=20 {
                monitor.update_progress(&id, current, 100, "downloading");
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let sessions = monitor.get_active_sessions();
    assert_eq!(sessions.len(), 8);
    for session in sessions {
        let currents: Vec<u32> = session.snapshots.iter().map(|s| s.current).collect();
        assert_eq!(currents, (1..=20).collect::<Vec<_>>(), "{}", session.id);
    }
}

// ====== Trend Tests ======

#[tokio::test(start_paused = true)]
async fn test_steady_progress_speed_within_bounds() {
    let monitor = monitor();
    monitor.create_session("steady", "https://example.org/ms", "gallica", 100);

    monitor.update_progress("steady", 0, 100, "downloading");
    for current in [10, 25, 40] {
        tokio::time::advance(Duration::from_secs(60)).await;
        monitor.update_progress("steady", current, 100, "downloading");
    }

    let trend = monitor.get_progress_trend("steady").unwrap();
    assert!(
        (10.0..=15.0).contains(&trend.average_speed),
        "speed {}",
        trend.average_speed
    );
    assert!(!trend.is_stuck);
    let eta = trend.estimated_time_remaining.unwrap();
    assert!((eta - 60.0 / trend.average_speed).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn test_one_page_per_minute_is_slow() {
    let config = Arc::new(MonitoringConfig::new());
    let _guard = config
        .update_library_config(
            "trinity_cambridge",
            LibraryConfigPatch {
                slow_progress_threshold: Some(2.0),
                stuck_threshold_minutes: Some(5.0),
                ..LibraryConfigPatch::default()
            },
        )
        .unwrap();
    let monitor = ProgressMonitor::new(Arc::clone(&config));
    monitor.create_session("slow", "https://example.org/ms", "trinity_cambridge", 100);

    for current in [1, 2] {
        tokio::time::advance(Duration::from_secs(60)).await;
        monitor.update_progress("slow", current, 100, "downloading");
    }

    let trend = monitor.get_progress_trend("slow").unwrap();
    assert!(trend.is_slow);
    assert!(trend.average_speed <= 2.0);
    assert!(!trend.is_stuck);
}

#[tokio::test(start_paused = true)]
async fn test_no_advance_means_no_eta() {
    let monitor = monitor();
    monitor.create_session("flat", "https://example.org/ms", "gallica", 100);
    monitor.update_progress("flat", 5, 100, "downloading");
    tokio::time::advance(Duration::from_secs(30)).await;
    monitor.update_progress("flat", 5, 100, "downloading");

    let trend = monitor.get_progress_trend("flat").unwrap();
    assert!(trend.average_speed.abs() < f64::EPSILON);
    assert!(trend.estimated_time_remaining.is_none());
}

// ====== Event Tests ======

#[tokio::test]
async fn test_stuck_detected_with_shrunk_threshold() {
    let config = Arc::new(MonitoringConfig::new());
    let _guard = config
        .update_library_config(
            "gallica",
            LibraryConfigPatch {
                stuck_threshold_minutes: Some(0.01),
                ..LibraryConfigPatch::default()
            },
        )
        .unwrap();
    let monitor = ProgressMonitor::new(Arc::clone(&config));
    let mut rx = monitor.subscribe();

    monitor.create_session("stall", "https://gallica.bnf.fr/ark", "gallica", 50);
    monitor.update_progress("stall", 3, 50, "downloading");

    let event = next_event(&mut rx, MonitorEventKind::StuckDetected)
        .await
        .expect("stuckDetected within 2s");
    assert_eq!(event.session_id(), "stall");
    assert!(monitor.get_progress_trend("stall").unwrap().is_stuck);
    monitor.complete_session("stall", false);
}

#[tokio::test]
async fn test_timeout_with_shrunk_base_and_session_kept() {
    let config = Arc::new(MonitoringConfig::new());
    let _guard = config
        .update_library_config(
            "gallica",
            LibraryConfigPatch {
                base_timeout_minutes: Some(0.01),
                ..LibraryConfigPatch::default()
            },
        )
        .unwrap();
    let monitor = ProgressMonitor::new(Arc::clone(&config));
    let mut rx = monitor.subscribe();

    monitor.create_session("late", "https://gallica.bnf.fr/ark", "gallica", 20);

    let event = next_event(&mut rx, MonitorEventKind::Timeout)
        .await
        .expect("timeout within 2s");
    assert_eq!(event.session_id(), "late");
    assert_eq!(monitor.get_active_sessions().len(), 1);
    monitor.cancel_session("late");
}

#[tokio::test]
async fn test_override_only_affects_new_sessions() {
    let config = Arc::new(MonitoringConfig::new());
    let monitor = ProgressMonitor::new(Arc::clone(&config));
    let before = monitor.create_session("before", "https://example.org", "gallica", 10);

    let guard = config
        .update_library_config(
            "gallica",
            LibraryConfigPatch {
                base_timeout_minutes: Some(1.0),
                ..LibraryConfigPatch::default()
            },
        )
        .unwrap();
    let after = monitor.create_session("after", "https://example.org", "gallica", 10);
    drop(guard);

    assert_eq!(before.effective_timeout, Duration::from_secs(15 * 60));
    assert_eq!(after.effective_timeout, Duration::from_secs(60));
    assert_eq!(
        monitor.get_session("before").unwrap().effective_timeout,
        Duration::from_secs(15 * 60)
    );
    assert_eq!(
        config.get_library_config("gallica").base_timeout_minutes,
        15.0
    );
}

#[tokio::test]
async fn test_completion_handler_receives_outcome_and_off_detaches() {
    let monitor = monitor();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener = monitor.on(
        MonitorEventKind::SessionCompleted,
        Arc::new(move |event: &MonitorEvent| {
            if let MonitorEvent::SessionCompleted {
                session_id,
                success,
                ..
            } = event
            {
                sink.lock().unwrap().push((session_id.clone(), *success));
            }
        }),
    );

    monitor.create_session("a", "https://example.org", "bl", 10);
    monitor.create_session("b", "https://example.org", "bl", 10);
    monitor.complete_session("a", true);
    assert!(monitor.off(listener));
    monitor.complete_session("b", false);

    assert_eq!(*seen.lock().unwrap(), vec![("a".to_string(), true)]);
}

// ====== Config Tests ======

#[test]
fn test_page_count_multiplier_examples() {
    let config = MonitoringConfig::new();
    for (pages, expected) in [(50, 1), (250, 2), (400, 3), (600, 4), (1000, 5)] {
        assert_eq!(
            config
                .generate_monitoring_config("gallica", pages)
                .page_count_multiplier,
            expected,
            "{pages} pages"
        );
    }
}

#[test]
fn test_recommendation_examples() {
    let config = MonitoringConfig::new();
    assert_eq!(
        config
            .get_download_recommendation("internet_culturale", 800, 100, 1.5, Some(60.0))
            .action,
        RecommendationAction::Split
    );
    assert_eq!(
        config
            .get_download_recommendation("gallica", 200, 100, 3.0, Some(15.0))
            .action,
        RecommendationAction::Continue
    );
}

// ====== Adapter Tests ======

struct PanickingDownloader;

#[async_trait]
impl ManuscriptDownloader for PanickingDownloader {
    type Output = ();
    type Error = String;

    async fn download_manuscript(&self, _url: &str, options: DownloadOptions) -> Result<(), String> {
        if let Some(callback) = options.on_progress {
            callback(ProgressTick::new(1, 10, "downloading"));
        }
        panic!("decoder crashed");
    }
}

struct PagedDownloader;

#[async_trait]
impl ManuscriptDownloader for PagedDownloader {
    type Output = u32;
    type Error = String;

    async fn download_manuscript(&self, _url: &str, options: DownloadOptions) -> Result<u32, String> {
        let callback = options.on_progress.ok_or("missing progress callback")?;
        for current in 1..=5 {
            callback(ProgressTick::new(current, 5, "downloading"));
        }
        Ok(5)
    }
}

#[tokio::test]
async fn test_adapter_panic_still_completes_session_as_failed() {
    let integration = Arc::new(ProgressIntegration::new(monitor()));
    let mut rx = integration.monitor().subscribe();

    let task_integration = Arc::clone(&integration);
    let joined = tokio::spawn(async move {
        task_integration
            .wrap_download_manuscript(
                &PanickingDownloader,
                "https://example.org/ms",
                "bodleian",
                10,
                MonitoredDownloadOptions::default(),
            )
            .await
    })
    .await;

    assert!(joined.unwrap_err().is_panic());
    let event = next_event(&mut rx, MonitorEventKind::SessionCompleted)
        .await
        .unwrap();
    assert!(matches!(
        event,
        MonitorEvent::SessionCompleted { success: false, .. }
    ));
    assert_eq!(integration.monitor().active_count(), 0);
}

#[tokio::test]
async fn test_adapter_enriches_ticks_for_caller() {
    let integration = ProgressIntegration::new(monitor());
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let options = MonitoredDownloadOptions {
        session_id: Some("custom-id".to_string()),
        on_progress: Some(Arc::new(move |progress: EnhancedProgress| {
            sink.lock().unwrap().push(progress);
        })),
        ..MonitoredDownloadOptions::default()
    };

    let pages = integration
        .wrap_download_manuscript(&PagedDownloader, "https://example.org/ms", "bl", 5, options)
        .await
        .unwrap();

    assert_eq!(pages, 5);
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 5);
    assert_eq!(received[4].current, 5);
    assert!((received[4].percentage - 100.0).abs() < f64::EPSILON);
    assert!(!received[4].is_stuck);
    assert!(integration.monitor().get_session("custom-id").is_none());
}

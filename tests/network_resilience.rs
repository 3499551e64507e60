//! Integration tests for the network resilience layer against a local HTTP mock.
//!
//! Every test skips (or fails with MANUSCRIPT_MONITOR_REQUIRE_SOCKET_TESTS=1)
//! when localhost sockets are unavailable.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use manuscript_monitor::network::{
    CircuitState, NetworkErrorKind, NetworkResilience, RequestContext, ResilienceError,
    RetryPolicy,
};
use manuscript_monitor::{MonitoringConfig, ProgressMonitor};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

use support::socket_guard::start_mock_server_or_skip;

/// Fast backoff so retries finish in milliseconds.
fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(10),
        Duration::from_millis(100),
        2.0,
    )
}

fn layer(max_attempts: u32) -> NetworkResilience {
    NetworkResilience::builder(Arc::new(MonitoringConfig::new()))
        .retry_policy(fast_policy(max_attempts))
        .build()
}

async fn request_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map_or(0, |requests| requests.len())
}

/// Answers the first `fail_count` requests with `status`, then 200 with `body`.
struct FlakyResponder {
    count: Arc<AtomicUsize>,
    fail_count: usize,
    failure: ResponseTemplate,
    body: &'static [u8],
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let n = self.count.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_count {
            self.failure.clone()
        } else {
            ResponseTemplate::new(200).set_body_bytes(self.body)
        }
    }
}

// ====== Retry Tests ======

#[tokio::test]
async fn test_server_errors_retried_then_body_returned() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/iiif/page/1"))
        .respond_with(FlakyResponder {
            count: Arc::new(AtomicUsize::new(0)),
            fail_count: 2,
            failure: ResponseTemplate::new(500),
            body: b"page-image",
        })
        .mount(&server)
        .await;

    let layer = layer(3);
    let url = format!("{}/iiif/page/1", server.uri());
    let body = layer
        .fetch_bytes(&url, &RequestContext::for_library("gallica", 10))
        .await
        .unwrap();

    assert_eq!(body, b"page-image");
    assert_eq!(request_count(&server).await, 3);
    assert_eq!(
        layer.circuit_breaker().state("127.0.0.1"),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let layer = layer(3);
    let url = format!("{}/missing", server.uri());
    let err = layer
        .fetch_bytes(&url, &RequestContext::default())
        .await
        .unwrap_err();

    assert_eq!(request_count(&server).await, 1);
    match err {
        ResilienceError::Network { attempts, source } => {
            assert_eq!(attempts, 1);
            assert_eq!(source.status(), Some(404));
            assert_eq!(source.kind(), NetworkErrorKind::Http4xx);
        }
        other => panic!("expected network error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_exhausted_retries_report_attempt_count() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let layer = layer(3);
    let url = format!("{}/flaky", server.uri());
    let err = layer
        .fetch_bytes(&url, &RequestContext::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::Network { attempts: 3, .. }));
    assert_eq!(err.kind(), Some(NetworkErrorKind::Http5xx));
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn test_retry_after_is_honoured() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(FlakyResponder {
            count: Arc::new(AtomicUsize::new(0)),
            fail_count: 1,
            failure: ResponseTemplate::new(429).insert_header("Retry-After", "1"),
            body: b"ok",
        })
        .mount(&server)
        .await;

    let layer = NetworkResilience::builder(Arc::new(MonitoringConfig::new()))
        .retry_policy(RetryPolicy::new(
            2,
            Duration::from_millis(10),
            Duration::from_secs(2),
            2.0,
        ))
        .build();
    let url = format!("{}/throttled", server.uri());
    let started = std::time::Instant::now();
    let body = layer
        .fetch_bytes(&url, &RequestContext::default())
        .await
        .unwrap();

    assert_eq!(body, b"ok");
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "second attempt must wait for Retry-After"
    );
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn test_retry_after_beyond_cap_fails_without_waiting() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "3600"))
        .mount(&server)
        .await;

    let layer = layer(3);
    let url = format!("{}/maintenance", server.uri());
    let started = std::time::Instant::now();
    let err = layer
        .fetch_bytes(&url, &RequestContext::default())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, ResilienceError::Network { attempts: 1, .. }));
    assert_eq!(err.kind(), Some(NetworkErrorKind::Http5xx));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let layer = NetworkResilience::builder(Arc::new(MonitoringConfig::new()))
        .retry_policy(fast_policy(1))
        .timeout_bounds(
            Duration::from_millis(300),
            Duration::from_millis(300),
            Duration::from_secs(1),
        )
        .build();
    let url = format!("{}/slow", server.uri());
    let err = layer
        .fetch_bytes(&url, &RequestContext::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(NetworkErrorKind::Timeout));
}

// ====== Circuit Breaker Tests ======

#[tokio::test]
async fn test_circuit_opens_and_fast_fails_without_request() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let layer = layer(1);
    let url = format!("{}/down", server.uri());
    for _ in 0..5 {
        let err = layer
            .fetch_bytes(&url, &RequestContext::default())
            .await
            .unwrap_err();
        assert!(!err.is_circuit_open());
    }
    assert_eq!(
        layer.circuit_breaker().state("127.0.0.1"),
        CircuitState::Open
    );

    let err = layer
        .fetch_bytes(&url, &RequestContext::default())
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert!(err.to_string().contains("circuit open"));
    assert_eq!(request_count(&server).await, 5);
}

#[tokio::test]
async fn test_client_errors_never_open_circuit() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let layer = layer(3);
    let url = format!("{}/forbidden", server.uri());
    for _ in 0..8 {
        let err = layer
            .fetch_bytes(&url, &RequestContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(NetworkErrorKind::Http4xx));
    }
    assert_eq!(
        layer.circuit_breaker().state("127.0.0.1"),
        CircuitState::Closed
    );
    assert_eq!(request_count(&server).await, 8);
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    // Bind then drop to get a port with nothing listening.
    let port = match std::net::TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => listener.local_addr().unwrap().port(),
        Err(_) => return,
    };
    let layer = layer(2);
    let url = format!("http://127.0.0.1:{port}/nothing");
    let err = layer
        .fetch_bytes(&url, &RequestContext::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(NetworkErrorKind::Network));
    assert!(matches!(err, ResilienceError::Network { attempts: 2, .. }));
}

// ====== Health and Progress Tests ======

#[tokio::test]
async fn test_health_snapshot_reports_pool_and_circuit() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x"))
        .mount(&server)
        .await;

    let layer = layer(1);
    let url = format!("{}/a", server.uri());
    layer
        .fetch_bytes(&url, &RequestContext::default())
        .await
        .unwrap();
    layer
        .fetch_bytes(&url, &RequestContext::default())
        .await
        .unwrap();

    let health = layer.health_snapshot();
    assert_eq!(health.circuits.len(), 1);
    assert_eq!(health.circuits[0].state, CircuitState::Closed);
    assert_eq!(health.pools.len(), 1);
    assert_eq!(health.pools[0].total_requests, 2);
    assert_eq!(health.pools[0].failures, 0);
    assert!(serde_json::to_string(&health).is_ok());
}

#[tokio::test]
async fn test_monitored_page_fetches_feed_progress_session() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg"))
        .mount(&server)
        .await;

    let config = Arc::new(MonitoringConfig::new());
    let layer = NetworkResilience::builder(Arc::clone(&config))
        .retry_policy(fast_policy(2))
        .build();
    let monitor = ProgressMonitor::new(config);
    monitor.create_session("bl-1", &server.uri(), "bl", 4);

    let ctx = RequestContext::for_library("bl", 4);
    for page in 1..=4_u32 {
        let url = format!("{}/page/{page}", server.uri());
        layer.fetch_bytes(&url, &ctx).await.unwrap();
        monitor.update_progress("bl-1", page, 4, "downloading");
    }

    let session = monitor.complete_session("bl-1", true).unwrap();
    assert_eq!(session.last_snapshot().unwrap().current, 4);
    assert_eq!(monitor.active_count(), 0);
}

//! Health probe tests against real local HTTP servers: liveness rules,
//! failure escalation, recovery, registry cross-checks.

mod common;

use async_trait::async_trait;
use axum::{http::StatusCode, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tunnelkeeper::config::HealthCheckPolicy;
use tunnelkeeper::error::{Result, TunnelError};
use tunnelkeeper::health::{HealthEvent, HealthProbe};
use tunnelkeeper::provider::{ActiveEndpoint, EndpointRegistry};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn fast_policy(max_consecutive_failures: u32) -> HealthCheckPolicy {
    HealthCheckPolicy {
        enabled: true,
        interval_ms: 25,
        timeout_ms: 500,
        max_consecutive_failures,
    }
}

/// Serve the given status code for every request on an ephemeral port
async fn serve_status(status: StatusCode) -> (String, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(move || async move { status });
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), handle)
}

/// A local URL nothing is listening on
async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

async fn next_event(rx: &mut broadcast::Receiver<HealthEvent>) -> HealthEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for health event")
        .expect("health event channel closed")
}

struct FixedRegistry {
    endpoints: Vec<ActiveEndpoint>,
    fail: bool,
}

#[async_trait]
impl EndpointRegistry for FixedRegistry {
    async fn active_endpoints(&self) -> Result<Vec<ActiveEndpoint>> {
        if self.fail {
            return Err(TunnelError::Probe("registry unavailable".to_string()));
        }
        Ok(self.endpoints.clone())
    }
}

#[tokio::test]
async fn any_http_response_counts_as_alive() {
    // A teapot response still proves the tunnel is forwarding
    let (url, server) = serve_status(StatusCode::IM_A_TEAPOT).await;
    let probe = HealthProbe::new(fast_policy(3));
    let mut events = probe.subscribe();

    probe.start(url, None);

    assert!(matches!(next_event(&mut events).await, HealthEvent::Healthy));
    let snapshot = probe.snapshot();
    assert!(snapshot.healthy);
    assert_eq!(snapshot.failure_count, 0);

    probe.stop();
    server.abort();
}

#[tokio::test]
async fn consecutive_failures_escalate_to_critical() {
    let probe = HealthProbe::new(fast_policy(2));
    let mut events = probe.subscribe();

    probe.start(dead_url().await, None);

    match next_event(&mut events).await {
        HealthEvent::Unhealthy { failures, .. } => assert_eq!(failures, 1),
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut events).await {
        HealthEvent::Unhealthy { failures, .. } => assert_eq!(failures, 2),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        HealthEvent::Critical { .. }
    ));

    // Still failing, so the next cycle re-escalates
    match next_event(&mut events).await {
        HealthEvent::Unhealthy { failures, .. } => assert_eq!(failures, 3),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        HealthEvent::Critical { .. }
    ));

    assert!(!probe.snapshot().healthy);
    probe.stop();
}

#[tokio::test]
async fn threshold_of_one_escalates_immediately() {
    let probe = HealthProbe::new(fast_policy(1));
    let mut events = probe.subscribe();

    probe.start(dead_url().await, None);

    assert!(matches!(
        next_event(&mut events).await,
        HealthEvent::Unhealthy { failures: 1, .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        HealthEvent::Critical { .. }
    ));

    probe.stop();
}

#[tokio::test]
async fn success_resets_the_failure_counter() {
    // Reserve a port, probe it while closed, then bring a server up on it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let probe = HealthProbe::new(fast_policy(10));
    let mut events = probe.subscribe();
    probe.start(format!("http://{addr}"), None);

    let mut failures_seen = 0;
    while failures_seen < 2 {
        if let HealthEvent::Unhealthy { .. } = next_event(&mut events).await {
            failures_seen += 1;
        }
    }

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let app = Router::new().fallback(|| async { StatusCode::OK });
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    loop {
        if let HealthEvent::Healthy = next_event(&mut events).await {
            break;
        }
    }
    assert_eq!(probe.snapshot().failure_count, 0);
    assert!(probe.snapshot().healthy);

    probe.stop();
    server.abort();
}

#[tokio::test]
async fn registry_mismatch_fails_even_when_url_responds() {
    let (url, server) = serve_status(StatusCode::OK).await;
    let registry: Arc<dyn EndpointRegistry> = Arc::new(FixedRegistry {
        endpoints: vec![ActiveEndpoint {
            public_url: "https://someone-else.test".to_string(),
            local_addr: "http://localhost:3000".to_string(),
        }],
        fail: false,
    });

    let probe = HealthProbe::new(fast_policy(5));
    let mut events = probe.subscribe();
    probe.start(url, Some(registry));

    match next_event(&mut events).await {
        HealthEvent::Unhealthy { error, failures } => {
            assert_eq!(failures, 1);
            assert!(error.contains("no longer registered"), "got: {error}");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    probe.stop();
    server.abort();
}

#[tokio::test]
async fn registry_errors_count_as_failures() {
    let (url, server) = serve_status(StatusCode::OK).await;
    let registry: Arc<dyn EndpointRegistry> = Arc::new(FixedRegistry {
        endpoints: vec![],
        fail: true,
    });

    let probe = HealthProbe::new(fast_policy(5));
    let mut events = probe.subscribe();
    probe.start(url, Some(registry));

    match next_event(&mut events).await {
        HealthEvent::Unhealthy { error, .. } => {
            assert!(error.contains("registry check failed"), "got: {error}");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    probe.stop();
    server.abort();
}

#[tokio::test]
async fn matching_registry_entry_is_healthy() {
    let (url, server) = serve_status(StatusCode::OK).await;
    let registry: Arc<dyn EndpointRegistry> = Arc::new(FixedRegistry {
        endpoints: vec![ActiveEndpoint {
            public_url: url.clone(),
            local_addr: "http://localhost:3000".to_string(),
        }],
        fail: false,
    });

    let probe = HealthProbe::new(fast_policy(5));
    let mut events = probe.subscribe();
    probe.start(url, Some(registry));

    assert!(matches!(next_event(&mut events).await, HealthEvent::Healthy));
    assert_eq!(probe.snapshot().failure_count, 0);

    probe.stop();
    server.abort();
}
